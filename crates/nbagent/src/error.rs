//! Error taxonomy for tool operations.
//!
//! Validation errors (`IndexOutOfRange`, `InvalidCellType`, `SessionNotFound`,
//! `DuplicateSession`) are returned before any side effect occurs.
//! `ExecutionTimeout` is returned only after best-effort cancel + interrupt and
//! carries whatever partial outputs existed at that point.

use serde::Serialize;

use crate::backend::traits::BackendError;
use crate::outputs::OutputItem;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Notebook '{0}' is already in use")]
    DuplicateSession(String),

    #[error("{0}")]
    SessionNotFound(String),

    #[error("Cell index {index} is out of range. Notebook has {cell_count} cells.")]
    IndexOutOfRange { index: i64, cell_count: usize },

    #[error("Invalid cell type '{0}'. Supported types: \"code\", \"markdown\"")]
    InvalidCellType(String),

    #[error("Cell execution timed out after {seconds} seconds")]
    ExecutionTimeout {
        seconds: u64,
        partial: Vec<OutputItem>,
    },

    #[error("Kernel unavailable: {0}")]
    KernelUnavailable(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Document mutation conflict: {0}")]
    DocumentMutationConflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured error payload returned across the tool boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
}

impl ToolError {
    /// Stable error kind for structured responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::DuplicateSession(_) => "duplicate_session",
            ToolError::SessionNotFound(_) => "session_not_found",
            ToolError::IndexOutOfRange { .. } => "index_out_of_range",
            ToolError::InvalidCellType(_) => "invalid_cell_type",
            ToolError::ExecutionTimeout { .. } => "execution_timeout",
            ToolError::KernelUnavailable(_) => "kernel_unavailable",
            ToolError::BackendUnreachable(_) => "backend_unreachable",
            ToolError::DocumentMutationConflict(_) => "document_mutation_conflict",
            ToolError::Internal(_) => "internal",
        }
    }

    /// Whether a bounded retry is worthwhile. Only transient connection loss
    /// qualifies; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::BackendUnreachable(_))
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<BackendError> for ToolError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unreachable(msg) => ToolError::BackendUnreachable(msg),
            BackendError::Kernel(msg) => ToolError::KernelUnavailable(msg),
            BackendError::Conflict(msg) => ToolError::DocumentMutationConflict(msg),
            BackendError::NotFound(msg) | BackendError::Room(msg) | BackendError::Protocol(msg) => {
                ToolError::Internal(msg)
            }
            BackendError::Io(e) => ToolError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        ToolError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable() {
        let err = ToolError::IndexOutOfRange {
            index: 7,
            cell_count: 3,
        };
        assert_eq!(err.kind(), "index_out_of_range");
        assert_eq!(
            err.to_string(),
            "Cell index 7 is out of range. Notebook has 3 cells."
        );
    }

    #[test]
    fn only_unreachable_is_transient() {
        assert!(ToolError::BackendUnreachable("connection closed".into()).is_transient());
        assert!(!ToolError::SessionNotFound("Notebook 'nb' is not in use".into()).is_transient());
        assert!(!ToolError::KernelUnavailable("dead".into()).is_transient());
    }

    #[test]
    fn payload_carries_kind_and_message() {
        let payload = ToolError::DuplicateSession("analysis".into()).payload();
        assert_eq!(payload.kind, "duplicate_session");
        assert!(payload.message.contains("analysis"));
    }
}
