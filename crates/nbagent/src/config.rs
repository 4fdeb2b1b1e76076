//! Coordinator configuration.
//!
//! An explicit value threaded through construction. There is no process-wide
//! mutable context; `main` builds one `Config` from CLI flags / environment and
//! hands it to `ServerContext::new`.

use std::path::PathBuf;
use std::time::Duration;

/// Default bound for a single cell execution.
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 300;

/// Default bound for the pre-submission kernel-idle wait. Deliberately much
/// shorter than the execution timeout.
pub const DEFAULT_IDLE_WAIT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the server hosting documents (contents + collaboration).
    pub document_url: String,
    /// Authentication token for the document server.
    pub document_token: Option<String>,
    /// Base URL of the server hosting kernels.
    pub runtime_url: String,
    /// Authentication token for the runtime server.
    pub runtime_token: Option<String>,
    /// Default notebook path used when a tool is invoked without a connected
    /// session having been established first.
    pub document_id: String,
    /// Whether image outputs are returned as image payloads or replaced with
    /// a text placeholder.
    pub allow_img_output: bool,
    /// Kernelspec name used when starting new kernels.
    pub kernel_name: String,
    /// Root directory for the embedded (in-process) content store.
    pub root_dir: Option<PathBuf>,
    /// Bound for a single cell execution unless the caller overrides it.
    pub execute_timeout: Duration,
    /// Bound for the kernel-idle wait before submitting an execution.
    pub idle_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            document_url: "http://localhost:8888".to_string(),
            document_token: None,
            runtime_url: "http://localhost:8888".to_string(),
            runtime_token: None,
            document_id: "notebook.ipynb".to_string(),
            allow_img_output: true,
            kernel_name: "python3".to_string(),
            root_dir: None,
            execute_timeout: Duration::from_secs(DEFAULT_EXECUTE_TIMEOUT_SECS),
            idle_wait_timeout: Duration::from_secs(DEFAULT_IDLE_WAIT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_jupyter() {
        let config = Config::default();
        assert_eq!(config.document_url, "http://localhost:8888");
        assert_eq!(config.execute_timeout, Duration::from_secs(300));
        assert!(config.idle_wait_timeout < config.execute_timeout);
    }
}
