//! The tool surface: one async function per tool name.
//!
//! Every tool is written against the abstract capability set selected by the
//! dispatcher; none of them branches on mode. `invoke` is the only seam a
//! wire transport needs: name in, JSON arguments in, success payload or typed
//! error out. Unexpected internal faults are caught here and converted to a
//! generic internal error carrying the original message.

mod edit;
mod execute;
mod notebook;
mod server;

use std::sync::Arc;

use futures::FutureExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::backend::ServerContext;
use crate::cells::CellPayload;
use crate::doc::DocResolver;
use crate::engine::ExecutionEngine;
use crate::error::ToolError;
use crate::outputs::OutputItem;
use crate::registry::{SessionRegistry, SharedRegistry};

/// Success payload of a tool call.
#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Message(String),
    Outputs(Vec<OutputItem>),
    Cell(CellPayload),
    Cells(Vec<CellPayload>),
}

impl ToolOutput {
    /// Human-readable rendering for text transports.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutput::Message(msg) => msg.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}

// ── Argument structs ────────────────────────────────────────────────

fn default_connect() -> String {
    "connect".to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UseNotebookArgs {
    /// Unique identifier for the notebook session.
    pub notebook_name: String,
    /// Path to the notebook file, relative to the server root. Defaults to
    /// the configured document id.
    pub notebook_path: Option<String>,
    /// "connect" to attach to an existing file, "create" to create it first.
    #[serde(default = "default_connect")]
    pub mode: String,
    /// Reuse a specific kernel instead of starting a new one.
    pub kernel_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NotebookNameArgs {
    /// Name of a connected notebook session.
    pub notebook_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CellIndexArgs {
    /// Target cell index (0-based).
    pub cell_index: i64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InsertCellArgs {
    /// Target index for insertion (0-based). Use -1 to append at the end.
    pub cell_index: i64,
    /// "code" or "markdown".
    pub cell_type: String,
    /// Source content for the new cell.
    pub cell_source: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct OverwriteCellArgs {
    /// Index of the cell to overwrite (0-based).
    pub cell_index: i64,
    /// New cell source; the cell keeps its type.
    pub cell_source: String,
}

fn default_progress_interval() -> u64 {
    5
}

fn default_ipython_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCellArgs {
    /// Index of the cell to execute (0-based).
    pub cell_index: i64,
    /// Maximum seconds to wait for the execution. Defaults to the configured
    /// execution timeout.
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCellStreamingArgs {
    /// Index of the cell to execute (0-based).
    pub cell_index: i64,
    /// Maximum seconds to wait for the execution. Defaults to the configured
    /// execution timeout.
    pub timeout_seconds: Option<u64>,
    /// Seconds between progress markers in the returned log.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InsertExecuteArgs {
    /// Target index for insertion (0-based). Use -1 to append at the end.
    pub cell_index: i64,
    /// Code source for the new cell.
    pub cell_source: String,
    /// Maximum seconds to wait for the execution. Defaults to the configured
    /// execution timeout.
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteIpythonArgs {
    /// Code to run directly against the current session's kernel.
    pub code: String,
    #[serde(default = "default_ipython_timeout")]
    pub timeout_seconds: u64,
}

fn default_list_depth() -> usize {
    3
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Directory to start from, relative to the server root.
    #[serde(default)]
    pub path: String,
    /// Maximum recursion depth.
    #[serde(default = "default_list_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// All tool functions, bound to one context.
pub struct Toolbox {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) registry: SharedRegistry,
    pub(crate) resolver: Arc<DocResolver>,
    pub(crate) engine: ExecutionEngine,
}

impl Toolbox {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let engine = ExecutionEngine::new(
            ctx.config.allow_img_output,
            ctx.config.idle_wait_timeout,
        );
        Self {
            ctx,
            registry: Arc::new(SessionRegistry::new()),
            resolver: Arc::new(DocResolver::new()),
            engine,
        }
    }

    /// Invoke a tool by name. The single entry point for wire transports.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let fut = std::panic::AssertUnwindSafe(self.dispatch(name, args));
        match fut.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ToolError::Internal(format!("internal fault: {message}")))
            }
        }
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        match name {
            "use_notebook" => self.use_notebook(parse(args)?).await,
            "list_notebook" => self.list_notebook().await,
            "restart_notebook" => self.restart_notebook(parse(args)?).await,
            "unuse_notebook" => self.unuse_notebook(parse(args)?).await,
            "switch_notebook" => self.switch_notebook(parse(args)?).await,
            "insert_cell" => self.insert_cell(parse(args)?).await,
            "insert_execute_code_cell" => self.insert_execute_code_cell(parse(args)?).await,
            "overwrite_cell_source" => self.overwrite_cell_source(parse(args)?).await,
            "delete_cell" => self.delete_cell(parse(args)?).await,
            "read_cell" => self.read_cell(parse(args)?).await,
            "read_cells" => self.read_cells().await,
            "list_cells" => self.list_cells().await,
            "execute_cell_simple_timeout" => {
                self.execute_cell_simple_timeout(parse(args)?).await
            }
            "execute_cell_with_progress" => self.execute_cell_with_progress(parse(args)?).await,
            "execute_cell_streaming" => self.execute_cell_streaming(parse(args)?).await,
            "execute_ipython" => self.execute_ipython(parse(args)?).await,
            "list_kernel" => self.list_kernel().await,
            "list_files" => self.list_files(parse(args)?).await,
            other => Err(ToolError::Internal(format!("unknown tool '{other}'"))),
        }
    }

    /// Tool names in a stable order.
    pub fn tool_names() -> &'static [&'static str] {
        &[
            "use_notebook",
            "list_notebook",
            "restart_notebook",
            "unuse_notebook",
            "switch_notebook",
            "insert_cell",
            "insert_execute_code_cell",
            "overwrite_cell_source",
            "delete_cell",
            "read_cell",
            "read_cells",
            "list_cells",
            "execute_cell_simple_timeout",
            "execute_cell_with_progress",
            "execute_cell_streaming",
            "execute_ipython",
            "list_kernel",
            "list_files",
        ]
    }

    /// JSON Schemas for every tool's arguments, keyed by tool name.
    pub fn schemas() -> Vec<(&'static str, Value)> {
        fn schema<T: JsonSchema>() -> Value {
            serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
        }
        vec![
            ("use_notebook", schema::<UseNotebookArgs>()),
            ("list_notebook", schema::<NoArgs>()),
            ("restart_notebook", schema::<NotebookNameArgs>()),
            ("unuse_notebook", schema::<NotebookNameArgs>()),
            ("switch_notebook", schema::<NotebookNameArgs>()),
            ("insert_cell", schema::<InsertCellArgs>()),
            ("insert_execute_code_cell", schema::<InsertExecuteArgs>()),
            ("overwrite_cell_source", schema::<OverwriteCellArgs>()),
            ("delete_cell", schema::<CellIndexArgs>()),
            ("read_cell", schema::<CellIndexArgs>()),
            ("read_cells", schema::<NoArgs>()),
            ("list_cells", schema::<NoArgs>()),
            ("execute_cell_simple_timeout", schema::<ExecuteCellArgs>()),
            ("execute_cell_with_progress", schema::<ExecuteCellArgs>()),
            ("execute_cell_streaming", schema::<ExecuteCellStreamingArgs>()),
            ("execute_ipython", schema::<ExecuteIpythonArgs>()),
            ("list_kernel", schema::<NoArgs>()),
            ("list_files", schema::<ListFilesArgs>()),
        ]
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args)
        .map_err(|e| ToolError::Internal(format!("invalid arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schemas_cover_every_tool() {
        let schema_names: Vec<&str> = Toolbox::schemas().iter().map(|(n, _)| *n).collect();
        assert_eq!(schema_names, Toolbox::tool_names());
    }

    #[test]
    fn args_defaults_apply() {
        let args: ExecuteCellArgs = serde_json::from_value(json!({"cell_index": 2})).unwrap();
        assert_eq!(args.timeout_seconds, None);
        let args: ExecuteIpythonArgs = serde_json::from_value(json!({"code": "x"})).unwrap();
        assert_eq!(args.timeout_seconds, 60);
        let args: UseNotebookArgs =
            serde_json::from_value(json!({"notebook_name": "a"})).unwrap();
        assert_eq!(args.mode, "connect");
    }
}
