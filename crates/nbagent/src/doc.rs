//! Document access resolution.
//!
//! `resolve` decides, per operation, whether a notebook path is backed by a
//! live collaborative structure or by its serialized file. The probe runs on
//! every call; liveness can change between calls because editors open and
//! close notebooks independently of this coordinator. Any probe failure
//! resolves to file mode: liveness is an optimization, never a correctness
//! requirement. The fallback reason is logged so backend trouble remains
//! visible in logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::backend::traits::{BackendError, ContentStore, DocChange, LiveDoc};
use crate::backend::{room_id_for, Backend};
use crate::cells::{source_lines, CellRecord};
use crate::error::ToolError;
use crate::outputs::scrub_transient;

/// Resolves paths to document targets and hands out per-room mutation locks.
#[derive(Default)]
pub struct DocResolver {
    locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl DocResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutation lock for one room. Mutations against different documents
    /// proceed in parallel; per-document they serialize.
    fn mutation_lock(&self, room_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock().expect("mutation lock table");
        locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    /// Resolve `path` to a live or file-backed target. Never cached; callers
    /// resolve, use, and discard within one operation.
    pub async fn resolve(
        &self,
        backend: &Backend,
        path: &str,
    ) -> Result<DocumentTarget, ToolError> {
        match backend.content.id_for(path).await {
            Ok(id) => {
                let room = room_id_for(&id);
                match backend.collab.has_room(&room).await {
                    Ok(true) => match backend.collab.get_room(&room).await {
                        Ok(doc) => {
                            debug!("[doc] {path}: live ({room})");
                            return Ok(DocumentTarget::Live {
                                doc,
                                lock: self.mutation_lock(&room),
                            });
                        }
                        Err(e) => {
                            debug!("[doc] {path}: room open but unattachable, using file mode: {e}");
                        }
                    },
                    Ok(false) => {}
                    Err(e) => {
                        debug!("[doc] {path}: liveness probe failed, using file mode: {e}");
                    }
                }
            }
            Err(e) => {
                debug!("[doc] {path}: no document id, using file mode: {e}");
            }
        }

        let raw = backend.content.get(path).await.map_err(|e| match e {
            BackendError::Unreachable(msg) => ToolError::BackendUnreachable(msg),
            other => ToolError::Internal(other.to_string()),
        })?;
        let file = FileDocument::parse(path, &raw, backend.content.clone())?;
        Ok(DocumentTarget::FileBacked(Arc::new(file)))
    }
}

/// A resolved notebook document: either the live shared structure or a
/// file-backed snapshot. Exactly one; never both.
pub enum DocumentTarget {
    Live {
        doc: Arc<dyn LiveDoc>,
        lock: Arc<TokioMutex<()>>,
    },
    FileBacked(Arc<FileDocument>),
}

impl DocumentTarget {
    pub fn is_live(&self) -> bool {
        matches!(self, DocumentTarget::Live { .. })
    }

    pub async fn cell_count(&self) -> Result<usize, ToolError> {
        match self {
            DocumentTarget::Live { doc, .. } => Ok(doc.cell_count().await?),
            DocumentTarget::FileBacked(file) => Ok(file.cell_count()),
        }
    }

    pub async fn cells(&self) -> Result<Vec<CellRecord>, ToolError> {
        match self {
            DocumentTarget::Live { doc, .. } => Ok(doc.cells().await?),
            DocumentTarget::FileBacked(file) => Ok(file.records()),
        }
    }

    pub async fn cell(&self, index: usize) -> Result<Option<CellRecord>, ToolError> {
        match self {
            DocumentTarget::Live { doc, .. } => Ok(doc.cell(index).await?),
            DocumentTarget::FileBacked(file) => Ok(file.record(index)),
        }
    }

    /// Outputs currently visible for one cell. The streaming strategies poll
    /// this while an execution runs.
    pub async fn outputs(&self, index: usize) -> Result<Vec<Value>, ToolError> {
        Ok(self.cell(index).await?.map(|c| c.outputs).unwrap_or_default())
    }

    /// Apply one structural change. Live targets serialize through the
    /// per-room mutation lock and land as a single origin-tagged transaction;
    /// file-backed targets rewrite the file.
    pub async fn apply(&self, change: DocChange) -> Result<(), ToolError> {
        match self {
            DocumentTarget::Live { doc, lock } => {
                let _guard = lock.lock().await;
                doc.apply(change, crate::ORIGIN).await?;
                Ok(())
            }
            DocumentTarget::FileBacked(file) => file.apply(change).await,
        }
    }

    /// Best-effort push of pending state toward other viewers.
    pub async fn sync(&self) -> Result<(), ToolError> {
        match self {
            DocumentTarget::Live { doc, .. } => Ok(doc.sync().await?),
            DocumentTarget::FileBacked(file) => file.flush().await,
        }
    }
}

/// File-backed snapshot of a notebook, written back whole on every change.
pub struct FileDocument {
    path: String,
    store: Arc<dyn ContentStore>,
    notebook: StdMutex<nbformat::v4::Notebook>,
    /// Serializes mutate-then-write cycles within this process.
    write_lock: TokioMutex<()>,
}

impl FileDocument {
    pub fn parse(
        path: &str,
        raw: &str,
        store: Arc<dyn ContentStore>,
    ) -> Result<Self, ToolError> {
        let notebook = match nbformat::parse_notebook(raw) {
            Ok(nbformat::Notebook::V4(nb)) => nb,
            Ok(nbformat::Notebook::Legacy(legacy)) => nbformat::upgrade_legacy_notebook(legacy)
                .map_err(|e| {
                    ToolError::Internal(format!("failed to upgrade notebook '{path}': {e}"))
                })?,
            Ok(nbformat::Notebook::V3(_)) => {
                return Err(ToolError::Internal(format!(
                    "failed to parse notebook '{path}': unsupported nbformat v3"
                )))
            }
            Err(e) => {
                return Err(ToolError::Internal(format!(
                    "failed to parse notebook '{path}': {e}"
                )))
            }
        };
        Ok(Self {
            path: path.to_string(),
            store,
            notebook: StdMutex::new(notebook),
            write_lock: TokioMutex::new(()),
        })
    }

    pub fn cell_count(&self) -> usize {
        self.notebook.lock().expect("notebook lock").cells.len()
    }

    pub fn records(&self) -> Vec<CellRecord> {
        let notebook = self.notebook.lock().expect("notebook lock");
        notebook.cells.iter().map(record_from_cell).collect()
    }

    pub fn record(&self, index: usize) -> Option<CellRecord> {
        let notebook = self.notebook.lock().expect("notebook lock");
        notebook.cells.get(index).map(record_from_cell)
    }

    pub async fn apply(&self, change: DocChange) -> Result<(), ToolError> {
        let _guard = self.write_lock.lock().await;
        {
            let mut notebook = self.notebook.lock().expect("notebook lock");
            apply_to_notebook(&mut notebook, change)?;
        }
        self.write_back().await
    }

    pub async fn flush(&self) -> Result<(), ToolError> {
        let _guard = self.write_lock.lock().await;
        self.write_back().await
    }

    async fn write_back(&self) -> Result<(), ToolError> {
        let serialized = {
            let notebook = self.notebook.lock().expect("notebook lock");
            nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook.clone()))
                .map_err(|e| ToolError::Internal(format!("serialize '{}': {e}", self.path)))?
        };
        self.store
            .save(&self.path, &serialized)
            .await
            .map_err(|e| match e {
                BackendError::Unreachable(msg) => ToolError::BackendUnreachable(msg),
                other => ToolError::Internal(other.to_string()),
            })
    }
}

fn record_from_cell(cell: &nbformat::v4::Cell) -> CellRecord {
    match cell {
        nbformat::v4::Cell::Code {
            source,
            outputs,
            execution_count,
            ..
        } => CellRecord {
            cell_type: "code".to_string(),
            source: source.concat(),
            outputs: outputs
                .iter()
                .filter_map(|o| serde_json::to_value(o).ok())
                .collect(),
            execution_count: execution_count.map(|n| n as i64),
        },
        nbformat::v4::Cell::Markdown { source, .. } => CellRecord {
            cell_type: "markdown".to_string(),
            source: source.concat(),
            ..Default::default()
        },
        nbformat::v4::Cell::Raw { source, .. } => CellRecord {
            cell_type: "raw".to_string(),
            source: source.concat(),
            ..Default::default()
        },
    }
}

fn empty_cell_metadata() -> nbformat::v4::CellMetadata {
    nbformat::v4::CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

fn new_cell(cell_type: &str, source: &str) -> nbformat::v4::Cell {
    let id = nbformat::v4::CellId::from(Uuid::new_v4());
    let metadata = empty_cell_metadata();
    let source = source_lines(source);
    match cell_type {
        "code" => nbformat::v4::Cell::Code {
            id,
            metadata,
            execution_count: None,
            source,
            outputs: vec![],
        },
        "markdown" => nbformat::v4::Cell::Markdown {
            id,
            metadata,
            source,
            attachments: None,
        },
        _ => nbformat::v4::Cell::Raw {
            id,
            metadata,
            source,
        },
    }
}

fn apply_to_notebook(
    notebook: &mut nbformat::v4::Notebook,
    change: DocChange,
) -> Result<(), ToolError> {
    match change {
        DocChange::InsertCell {
            index,
            cell_type,
            source,
        } => {
            let index = index.min(notebook.cells.len());
            notebook.cells.insert(index, new_cell(&cell_type, &source));
        }
        DocChange::DeleteCell { index } => {
            if index >= notebook.cells.len() {
                return Err(ToolError::Internal(format!(
                    "delete index {index} beyond cell count {}",
                    notebook.cells.len()
                )));
            }
            notebook.cells.remove(index);
        }
        DocChange::SetSource { index, source } => {
            if let Some(cell) = notebook.cells.get_mut(index) {
                let lines = source_lines(&source);
                match cell {
                    nbformat::v4::Cell::Code { source, .. }
                    | nbformat::v4::Cell::Markdown { source, .. }
                    | nbformat::v4::Cell::Raw { source, .. } => *source = lines,
                }
            }
        }
        DocChange::ClearOutputs { index } => {
            if let Some(nbformat::v4::Cell::Code {
                outputs,
                execution_count,
                ..
            }) = notebook.cells.get_mut(index)
            {
                outputs.clear();
                *execution_count = None;
            }
        }
        DocChange::AppendOutput { index, output } => {
            if let Some(nbformat::v4::Cell::Code { outputs, .. }) = notebook.cells.get_mut(index)
            {
                let mut output = output;
                scrub_transient(&mut output);
                match serde_json::from_value::<nbformat::v4::Output>(output) {
                    Ok(parsed) => outputs.push(parsed),
                    Err(e) => warn!("[doc] dropping unconvertible output: {e}"),
                }
            }
        }
        DocChange::SetExecutionCount { index, count } => {
            if let Some(nbformat::v4::Cell::Code {
                execution_count, ..
            }) = notebook.cells.get_mut(index)
            {
                *execution_count = Some(count as i32);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local_content::LocalContentStore;
    use crate::backend::rooms::RoomRegistry;
    use crate::backend::testing::ScriptedKernelApi;
    use serde_json::json;

    fn file_backend(root: &std::path::Path) -> Backend {
        Backend {
            content: Arc::new(LocalContentStore::new(root)),
            kernels: Arc::new(ScriptedKernelApi::new()),
            collab: Arc::new(RoomRegistry::new()),
        }
    }

    #[tokio::test]
    async fn resolves_file_backed_when_no_room_is_open() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = file_backend(tmp.path());
        backend.content.create("nb.ipynb").await.unwrap();

        let resolver = DocResolver::new();
        let target = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        assert!(!target.is_live());
        assert_eq!(target.cell_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resolves_live_when_room_is_open_and_sees_closure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rooms = Arc::new(RoomRegistry::new());
        let backend = Backend {
            content: Arc::new(LocalContentStore::new(tmp.path())),
            kernels: Arc::new(ScriptedKernelApi::new()),
            collab: rooms.clone(),
        };
        backend.content.create("nb.ipynb").await.unwrap();

        let id = backend.content.id_for("nb.ipynb").await.unwrap();
        rooms.open_room(&room_id_for(&id), &[]);

        let resolver = DocResolver::new();
        let target = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        assert!(target.is_live());

        // Liveness is re-probed per call: closing the room flips the next
        // resolution to file mode.
        rooms.close_room(&room_id_for(&id));
        let target = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        assert!(!target.is_live());
    }

    #[tokio::test]
    async fn file_backed_mutations_rewrite_the_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = file_backend(tmp.path());
        backend.content.create("nb.ipynb").await.unwrap();

        let resolver = DocResolver::new();
        let target = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        target
            .apply(DocChange::InsertCell {
                index: 0,
                cell_type: "code".to_string(),
                source: "print('hi')".to_string(),
            })
            .await
            .unwrap();

        // A fresh resolution reads the change back from the file.
        let reread = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        assert_eq!(reread.cell_count().await.unwrap(), 1);
        let cell = reread.cell(0).await.unwrap().unwrap();
        assert_eq!(cell.source, "print('hi')");
    }

    #[tokio::test]
    async fn transient_fields_do_not_reach_the_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = file_backend(tmp.path());
        backend.content.create("nb.ipynb").await.unwrap();

        let resolver = DocResolver::new();
        let target = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        target
            .apply(DocChange::InsertCell {
                index: 0,
                cell_type: "code".to_string(),
                source: "plot()".to_string(),
            })
            .await
            .unwrap();
        target
            .apply(DocChange::AppendOutput {
                index: 0,
                output: json!({
                    "output_type": "display_data",
                    "data": {"text/plain": "Figure"},
                    "metadata": {},
                    "transient": {"display_id": "disp-1"},
                }),
            })
            .await
            .unwrap();

        let raw = backend.content.get("nb.ipynb").await.unwrap();
        assert!(!raw.contains("transient"));
        // The re-read file still validates and keeps the output.
        let reread = resolver.resolve(&backend, "nb.ipynb").await.unwrap();
        assert_eq!(reread.cell(0).await.unwrap().unwrap().outputs.len(), 1);
    }

    #[tokio::test]
    async fn missing_notebook_is_an_error_not_a_fallback() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = file_backend(tmp.path());
        let resolver = DocResolver::new();
        assert!(resolver.resolve(&backend, "missing.ipynb").await.is_err());
    }
}
