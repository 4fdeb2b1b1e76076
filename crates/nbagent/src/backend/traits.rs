//! Collaborator traits consumed by the coordinator.
//!
//! Every tool-level operation is written once against this capability set and
//! never branches on mode; only the dispatcher in `backend` picks which
//! implementation backs a call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cells::CellRecord;

/// Errors surfaced by collaborator implementations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("kernel error: {0}")]
    Kernel(String),

    #[error("room unavailable: {0}")]
    Room(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("mutation conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One entry in a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    /// "directory", "notebook", or "file"
    pub kind: String,
    pub size: Option<u64>,
    pub last_modified: Option<String>,
}

/// Content storage: read/write/list files, resolve stable document ids.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Read a notebook file as raw JSON text.
    async fn get(&self, path: &str) -> Result<String, BackendError>;

    /// Write a notebook file from raw JSON text.
    async fn save(&self, path: &str, content: &str) -> Result<(), BackendError>;

    /// Create a new empty notebook at `path`.
    async fn create(&self, path: &str) -> Result<(), BackendError>;

    /// Delete the file at `path`.
    async fn delete(&self, path: &str) -> Result<(), BackendError>;

    /// List a directory. `path` is relative to the store root; empty means
    /// the root itself.
    async fn list(&self, path: &str) -> Result<Vec<ContentEntry>, BackendError>;

    /// Stable document id for a path. Liveness probing keys rooms by this id.
    async fn id_for(&self, path: &str) -> Result<String, BackendError>;
}

/// Execution lifecycle events streamed by a kernel channel.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    /// The kernel accepted the request and assigned an execution count.
    Started { execution_count: Option<i64> },
    /// One nbformat-shaped output record, in emission order.
    Output(Value),
    /// The kernel went idle for this request.
    Done(ExecStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Ok,
    Error,
    Aborted,
}

/// Messaging channel to one running kernel.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    fn kernel_id(&self) -> &str;

    /// Submit code and stream back lifecycle events. Dropping the receiver
    /// abandons the observation; it does not stop the kernel, which is what
    /// the separate `interrupt` is for.
    async fn execute(&self, code: &str) -> Result<mpsc::Receiver<KernelEvent>, BackendError>;

    /// Fire-and-forget interrupt signal.
    async fn interrupt(&self) -> Result<(), BackendError>;

    async fn is_alive(&self) -> bool;

    /// Advisory busy flag from the most recent kernel status message.
    fn is_idle(&self) -> bool;

    async fn shutdown(&self) -> Result<(), BackendError>;
}

/// Shared handle to one running kernel.
///
/// Ownership is shared between the session that created it and any execution
/// observing it; the kernel process stops only when its session is removed or
/// restarted. The permit serializes executions: at most one may be in flight
/// per kernel.
#[derive(Clone)]
pub struct KernelHandle {
    pub id: String,
    pub channel: Arc<dyn KernelChannel>,
    exec_permit: Arc<tokio::sync::Mutex<()>>,
}

impl KernelHandle {
    pub fn new(channel: Arc<dyn KernelChannel>) -> Self {
        Self {
            id: channel.kernel_id().to_string(),
            channel,
            exec_permit: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Acquire the single-execution permit, waiting at most `wait`.
    pub async fn acquire_execution(
        &self,
        wait: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, BackendError> {
        tokio::time::timeout(wait, self.exec_permit.clone().lock_owned())
            .await
            .map_err(|_| {
                BackendError::Kernel(format!(
                    "kernel {} still busy after {}s",
                    self.id,
                    wait.as_secs()
                ))
            })
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle").field("id", &self.id).finish()
    }
}

/// Row for `list_kernel`.
#[derive(Debug, Clone, Serialize)]
pub struct KernelInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub connections: String,
    pub last_activity: String,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            id: "unknown".to_string(),
            name: "unknown".to_string(),
            state: "unknown".to_string(),
            connections: "unknown".to_string(),
            last_activity: "unknown".to_string(),
        }
    }
}

/// Kernel process management.
#[async_trait]
pub trait KernelApi: Send + Sync {
    /// Start a new kernel, returning its id.
    async fn start(&self) -> Result<String, BackendError>;

    /// Open a handle to an existing kernel.
    async fn get(&self, kernel_id: &str) -> Result<KernelHandle, BackendError>;

    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), BackendError>;

    async fn is_alive(&self, kernel: &KernelHandle) -> bool;

    /// Stop the kernel process. Callers treat failures as best-effort cleanup.
    async fn stop(&self, kernel: &KernelHandle) -> Result<(), BackendError>;

    /// All kernels visible to this backend.
    async fn list(&self) -> Result<Vec<KernelInfo>, BackendError>;
}

/// One structural change to a document, applied as a single transaction.
#[derive(Debug, Clone)]
pub enum DocChange {
    InsertCell {
        index: usize,
        cell_type: String,
        source: String,
    },
    DeleteCell {
        index: usize,
    },
    SetSource {
        index: usize,
        source: String,
    },
    ClearOutputs {
        index: usize,
    },
    AppendOutput {
        index: usize,
        output: Value,
    },
    SetExecutionCount {
        index: usize,
        count: i64,
    },
}

/// A live collaboratively-shared notebook structure.
#[async_trait]
pub trait LiveDoc: Send + Sync {
    async fn cell_count(&self) -> Result<usize, BackendError>;

    async fn cells(&self) -> Result<Vec<CellRecord>, BackendError>;

    async fn cell(&self, index: usize) -> Result<Option<CellRecord>, BackendError>;

    /// Apply one change as an atomic transaction tagged with `origin`, so
    /// coordinator edits are distinguishable from other editors in the shared
    /// document's history.
    async fn apply(&self, change: DocChange, origin: &str) -> Result<(), BackendError>;

    /// Best-effort push of pending state to other viewers.
    async fn sync(&self) -> Result<(), BackendError>;
}

/// The collaboration backend's view of open documents.
#[async_trait]
pub trait CollabBackend: Send + Sync {
    async fn has_room(&self, room_id: &str) -> Result<bool, BackendError>;

    async fn get_room(&self, room_id: &str) -> Result<Arc<dyn LiveDoc>, BackendError>;
}
