//! End-to-end tool tests against the embedded backend with scripted kernels.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use nbagent::backend::local_content::LocalContentStore;
use nbagent::backend::rooms::RoomRegistry;
use nbagent::backend::testing::ScriptedKernelApi;
use nbagent::backend::traits::{CollabBackend, ContentStore, LiveDoc};
use nbagent::backend::{room_id_for, Backend, ServerContext};
use nbagent::config::Config;
use nbagent::error::ToolError;
use nbagent::outputs::OutputItem;
use nbagent::tools::{ToolOutput, Toolbox};

struct Harness {
    toolbox: Toolbox,
    kernels: Arc<ScriptedKernelApi>,
    rooms: Arc<RoomRegistry>,
    content: Arc<LocalContentStore>,
    _tmp: TempDir,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let kernels = Arc::new(ScriptedKernelApi::new());
    let rooms = Arc::new(RoomRegistry::new());
    let content = Arc::new(LocalContentStore::new(tmp.path()));

    let backend = Backend {
        content: content.clone(),
        kernels: kernels.clone(),
        collab: rooms.clone(),
    };
    let config = Config {
        root_dir: Some(tmp.path().to_path_buf()),
        ..Config::default()
    };
    let ctx = ServerContext::embedded(config, backend);

    Harness {
        toolbox: Toolbox::new(Arc::new(ctx)),
        kernels,
        rooms,
        content,
        _tmp: tmp,
    }
}

fn message(output: ToolOutput) -> String {
    match output {
        ToolOutput::Message(msg) => msg,
        other => panic!("expected message, got {}", other.to_text()),
    }
}

fn outputs(output: ToolOutput) -> Vec<OutputItem> {
    match output {
        ToolOutput::Outputs(items) => items,
        other => panic!("expected outputs, got {}", other.to_text()),
    }
}

async fn connect(h: &Harness, name: &str, path: &str) {
    let result = h
        .toolbox
        .invoke(
            "use_notebook",
            json!({"notebook_name": name, "notebook_path": path, "mode": "create"}),
        )
        .await
        .unwrap();
    assert!(message(result).contains("Successfully created and using notebook"));
}

#[tokio::test]
async fn use_notebook_is_idempotent() {
    let h = harness();
    connect(&h, "analysis", "analysis.ipynb").await;

    let second = h
        .toolbox
        .invoke(
            "use_notebook",
            json!({"notebook_name": "analysis", "notebook_path": "analysis.ipynb"}),
        )
        .await
        .unwrap();
    assert!(message(second).contains("already in use"));
    // No second session, no second kernel.
    assert_eq!(h.kernels.started_count(), 1);
}

#[tokio::test]
async fn connect_requires_existing_notebook() {
    let h = harness();
    let result = h
        .toolbox
        .invoke(
            "use_notebook",
            json!({"notebook_name": "nb", "notebook_path": "missing.ipynb"}),
        )
        .await
        .unwrap();
    assert!(message(result).contains("not found"));
    assert_eq!(h.kernels.started_count(), 0);
}

#[tokio::test]
async fn markdown_cell_scenario_round_trips() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let inserted = h
        .toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "markdown", "cell_source": "# Title"}),
        )
        .await
        .unwrap();
    assert!(message(inserted).contains("Cell inserted successfully at index 0 (markdown)!"));

    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert!(table.contains("0\tmarkdown\tN/A\t# Title"));

    let deleted = message(
        h.toolbox
            .invoke("delete_cell", json!({"cell_index": 0}))
            .await
            .unwrap(),
    );
    assert!(deleted.contains("Cell 0 (markdown) deleted successfully."));

    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert_eq!(table, "Notebook is empty, no cells found.");
}

#[tokio::test]
async fn inserted_source_reads_back_at_every_index() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    for i in 0..4 {
        h.toolbox
            .invoke(
                "insert_cell",
                json!({"cell_index": i, "cell_type": "code", "cell_source": format!("x = {i}")}),
            )
            .await
            .unwrap();
    }

    for i in 0..4 {
        let cell = h
            .toolbox
            .invoke("read_cell", json!({"cell_index": i}))
            .await
            .unwrap();
        match cell {
            ToolOutput::Cell(payload) => {
                assert_eq!(payload.index, i as usize);
                assert_eq!(payload.source, vec![format!("x = {i}")]);
            }
            other => panic!("expected cell, got {}", other.to_text()),
        }
    }
}

#[tokio::test]
async fn out_of_range_indices_are_rejected_without_mutation() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "1"}),
        )
        .await
        .unwrap();

    for (tool, args) in [
        ("read_cell", json!({"cell_index": 5})),
        ("delete_cell", json!({"cell_index": 5})),
        ("overwrite_cell_source", json!({"cell_index": 5, "cell_source": "y"})),
        ("insert_cell", json!({"cell_index": 5, "cell_type": "code", "cell_source": "y"})),
        ("read_cell", json!({"cell_index": -1})),
        ("execute_cell_simple_timeout", json!({"cell_index": 5})),
    ] {
        let err = h.toolbox.invoke(tool, args).await.unwrap_err();
        assert!(
            matches!(err, ToolError::IndexOutOfRange { .. }),
            "{tool} did not reject"
        );
    }

    // Cell count unchanged throughout.
    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert_eq!(table.lines().count(), 3);
}

#[tokio::test]
async fn append_then_delete_restores_cell_count() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "first"}),
        )
        .await
        .unwrap();

    let inserted = message(
        h.toolbox
            .invoke(
                "insert_cell",
                json!({"cell_index": -1, "cell_type": "code", "cell_source": "1+1"}),
            )
            .await
            .unwrap(),
    );
    assert!(inserted.contains("at index 1 (code)"));

    h.toolbox
        .invoke("delete_cell", json!({"cell_index": 1}))
        .await
        .unwrap();

    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert!(table.contains("0\tcode"));
    assert!(!table.contains("1\tcode"));
}

#[tokio::test]
async fn switching_current_session_is_total_and_exclusive() {
    let h = harness();
    connect(&h, "a", "a.ipynb").await;
    connect(&h, "b", "b.ipynb").await;

    let listing = message(h.toolbox.invoke("list_notebook", json!({})).await.unwrap());
    assert!(listing.contains("b\tb.ipynb"));

    h.toolbox
        .invoke("switch_notebook", json!({"notebook_name": "a"}))
        .await
        .unwrap();

    let listing = message(h.toolbox.invoke("list_notebook", json!({})).await.unwrap());
    let current_rows: Vec<&str> = listing.lines().filter(|l| l.ends_with("\tyes")).collect();
    assert_eq!(current_rows.len(), 1);
    assert!(current_rows[0].starts_with("a\t"));

    let err = h
        .toolbox
        .invoke("switch_notebook", json!({"notebook_name": "zzz"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::SessionNotFound(_)));
}

#[tokio::test]
async fn sessions_are_isolated_from_each_other() {
    let h = harness();
    connect(&h, "a", "a.ipynb").await;
    connect(&h, "b", "b.ipynb").await;

    // "b" is current after connect; switch back to "a" and mutate it.
    h.toolbox
        .invoke("switch_notebook", json!({"notebook_name": "a"}))
        .await
        .unwrap();
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "only in a"}),
        )
        .await
        .unwrap();

    h.toolbox
        .invoke("switch_notebook", json!({"notebook_name": "b"}))
        .await
        .unwrap();
    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert_eq!(table, "Notebook is empty, no cells found.");
}

#[tokio::test]
async fn unuse_stops_the_kernel_and_is_not_repeatable() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let gone = message(
        h.toolbox
            .invoke("unuse_notebook", json!({"notebook_name": "nb"}))
            .await
            .unwrap(),
    );
    assert!(gone.contains("disconnected"));
    assert_eq!(h.kernels.stopped.load(std::sync::atomic::Ordering::SeqCst), 1);

    let err = h
        .toolbox
        .invoke("unuse_notebook", json!({"notebook_name": "nb"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::SessionNotFound(_)));
}

#[tokio::test]
async fn restart_discards_the_old_kernel() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let before = message(h.toolbox.invoke("list_notebook", json!({})).await.unwrap());
    h.toolbox
        .invoke("restart_notebook", json!({"notebook_name": "nb"}))
        .await
        .unwrap();
    let after = message(h.toolbox.invoke("list_notebook", json!({})).await.unwrap());

    assert_ne!(before, after);
    assert_eq!(h.kernels.started_count(), 2);
    assert_eq!(h.kernels.stopped.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fast_execution_returns_real_result() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "1+1"}),
        )
        .await
        .unwrap();

    let result = outputs(
        h.toolbox
            .invoke(
                "execute_cell_simple_timeout",
                json!({"cell_index": 0, "timeout_seconds": 30}),
            )
            .await
            .unwrap(),
    );
    assert_eq!(result, vec![OutputItem::text("1+1")]);

    // Outputs and execution count are visible on a later read.
    let cell = h
        .toolbox
        .invoke("read_cell", json!({"cell_index": 0}))
        .await
        .unwrap();
    match cell {
        ToolOutput::Cell(payload) => {
            assert_eq!(payload.execution_count, Some(1));
            assert_eq!(payload.outputs.unwrap(), vec![OutputItem::text("1+1")]);
        }
        other => panic!("expected cell, got {}", other.to_text()),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_execution_reports_timeout_marker() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "sleep 600"}),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = outputs(
        h.toolbox
            .invoke(
                "execute_cell_simple_timeout",
                json!({"cell_index": 0, "timeout_seconds": 3}),
            )
            .await
            .unwrap(),
    );
    assert!(started.elapsed() < tokio::time::Duration::from_secs(30));
    assert_eq!(
        result.last().unwrap(),
        &OutputItem::text("[TIMEOUT ERROR: Cell execution exceeded 3 seconds]")
    );
}

#[tokio::test(start_paused = true)]
async fn with_progress_surfaces_partial_outputs_on_timeout() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "emit 100 1000"}),
        )
        .await
        .unwrap();

    let result = outputs(
        h.toolbox
            .invoke(
                "execute_cell_with_progress",
                json!({"cell_index": 0, "timeout_seconds": 5}),
            )
            .await
            .unwrap(),
    );
    let last = result.last().unwrap().as_text().to_string();
    assert!(last.contains("[TIMEOUT ERROR: Execution exceeded 5 seconds]"));
    // Chunks produced before the deadline were not discarded.
    assert!(result.iter().any(|o| o.as_text().contains("chunk 0")));
}

#[tokio::test(start_paused = true)]
async fn streaming_log_tags_outputs_with_elapsed_time() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;
    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "emit 3 1500"}),
        )
        .await
        .unwrap();

    let result = outputs(
        h.toolbox
            .invoke(
                "execute_cell_streaming",
                json!({"cell_index": 0, "timeout_seconds": 60, "progress_interval": 2}),
            )
            .await
            .unwrap(),
    );
    let text: Vec<&str> = result.iter().map(|o| o.as_text()).collect();
    assert!(text.iter().any(|t| t.contains("chunk 1")));
    assert!(text.iter().any(|t| t.starts_with("[PROGRESS:")));
    assert!(text.iter().any(|t| t.starts_with("[COMPLETED in")));
}

#[tokio::test(start_paused = true)]
async fn execute_ipython_runs_inline_code() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let result = outputs(
        h.toolbox
            .invoke("execute_ipython", json!({"code": "2*21"}))
            .await
            .unwrap(),
    );
    assert_eq!(result, vec![OutputItem::text("2*21")]);
}

#[tokio::test(start_paused = true)]
async fn insert_execute_appends_and_runs() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let result = outputs(
        h.toolbox
            .invoke(
                "insert_execute_code_cell",
                json!({"cell_index": -1, "cell_source": "6*7"}),
            )
            .await
            .unwrap(),
    );
    assert_eq!(result, vec![OutputItem::text("6*7")]);

    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert!(table.contains("0\tcode\t1\t6*7"));
}

#[tokio::test]
async fn live_room_mutations_bypass_the_file() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let id = h.content.id_for("nb.ipynb").await.unwrap();
    let room_id = room_id_for(&id);
    h.rooms.open_room(&room_id, &[]);

    h.toolbox
        .invoke(
            "insert_cell",
            json!({"cell_index": 0, "cell_type": "code", "cell_source": "live edit"}),
        )
        .await
        .unwrap();

    // The shared structure changed; the serialized file did not.
    let room = h.rooms.get_room(&room_id).await.unwrap();
    assert_eq!(room.cell_count().await.unwrap(), 1);
    let raw = h.content.get("nb.ipynb").await.unwrap();
    assert!(!raw.contains("live edit"));

    // Closing the room flips the next operation back to the file.
    h.rooms.close_room(&room_id);
    let table = message(h.toolbox.invoke("list_cells", json!({})).await.unwrap());
    assert_eq!(table, "Notebook is empty, no cells found.");
}

#[tokio::test]
async fn list_kernel_reports_sessions() {
    let h = harness();
    connect(&h, "nb", "nb.ipynb").await;

    let listing = message(h.toolbox.invoke("list_kernel", json!({})).await.unwrap());
    assert!(listing.starts_with("ID\tName\tState\tConnections\tLast_Activity"));
    assert!(listing.contains("scripted-0"));
}

#[tokio::test]
async fn list_files_walks_the_content_root() {
    let h = harness();
    h.content.create("nb.ipynb").await.unwrap();
    h.content.save("data/raw/readme.txt", "hello").await.unwrap();

    let listing = message(
        h.toolbox
            .invoke("list_files", json!({"path": "", "max_depth": 3}))
            .await
            .unwrap(),
    );
    assert!(listing.contains("nb.ipynb\tnotebook"));
    assert!(listing.contains("data\tdirectory"));
    assert!(listing.contains("data/raw/readme.txt\tfile\t5B"));
}

#[tokio::test]
async fn unknown_tool_is_an_internal_error() {
    let h = harness();
    let err = h.toolbox.invoke("no_such_tool", json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::Internal(_)));
    assert_eq!(err.payload().kind, "internal");
}

#[tokio::test]
async fn tools_require_a_current_session() {
    let h = harness();
    for (tool, args) in [
        ("list_cells", json!({})),
        ("read_cells", json!({})),
        ("execute_ipython", json!({"code": "1"})),
    ] {
        let err = h.toolbox.invoke(tool, args).await.unwrap_err();
        assert!(matches!(err, ToolError::SessionNotFound(_)), "{tool}");
    }
}
