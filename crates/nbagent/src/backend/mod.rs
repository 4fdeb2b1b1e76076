//! Capability selection between embedded and networked collaborators.
//!
//! Every tool-level operation is written against [`Backend`]'s trait objects.
//! Only [`ServerContext::select_backend`] decides which implementation set a
//! call uses: the embedded set when the hosting process supplied its internal
//! managers, the networked set built from the configured URLs otherwise. The
//! check is made per call but is cheap and side-effect-free, so tests can
//! exercise both paths from one process.

pub mod http;
pub mod local_content;
pub mod rooms;
pub mod testing;
pub mod traits;
pub mod zmq_kernel;

use std::sync::Arc;

use crate::config::Config;
use http::{HttpClient, HttpCollabBackend, HttpContentStore, HttpKernelApi};
use local_content::LocalContentStore;
use rooms::RoomRegistry;
use traits::{CollabBackend, ContentStore, KernelApi};
use zmq_kernel::LocalKernelApi;

/// Room id for a document id. The collaboration backend keys open documents
/// by this derived id.
pub fn room_id_for(document_id: &str) -> String {
    format!("notebook:{document_id}")
}

/// One set of collaborator handles.
#[derive(Clone)]
pub struct Backend {
    pub content: Arc<dyn ContentStore>,
    pub kernels: Arc<dyn KernelApi>,
    pub collab: Arc<dyn CollabBackend>,
}

/// Explicit per-process context: configuration plus the collaborator sets.
///
/// Construction happens once at startup (or per test); nothing here is a
/// process-wide mutable global.
pub struct ServerContext {
    pub config: Config,
    embedded: Option<Backend>,
    networked: Backend,
}

impl ServerContext {
    /// Context for a standalone coordinator process. Only the networked set
    /// is available.
    pub fn networked(config: Config) -> Self {
        let networked = build_networked(&config);
        Self {
            config,
            embedded: None,
            networked,
        }
    }

    /// Context for a coordinator embedded in the notebook server process,
    /// with direct handles to the host's internal managers.
    pub fn embedded(config: Config, host: Backend) -> Self {
        let networked = build_networked(&config);
        Self {
            config,
            embedded: Some(host),
            networked,
        }
    }

    /// Build an embedded context whose host managers are this process's own
    /// filesystem store, room table, and kernel launcher.
    pub fn embedded_in_process(config: Config) -> Self {
        let root = config
            .root_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let host = Backend {
            content: Arc::new(LocalContentStore::new(root)),
            kernels: Arc::new(LocalKernelApi::new(config.kernel_name.clone())),
            collab: Arc::new(RoomRegistry::new()),
        };
        Self::embedded(config, host)
    }

    /// Pick the collaborator set for one call.
    pub fn select_backend(&self) -> Backend {
        match &self.embedded {
            Some(backend) => backend.clone(),
            None => self.networked.clone(),
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.embedded.is_some() {
            "embedded"
        } else {
            "networked"
        }
    }
}

fn build_networked(config: &Config) -> Backend {
    let document_http = HttpClient::new(&config.document_url, config.document_token.clone());
    let runtime_http = HttpClient::new(&config.runtime_url, config.runtime_token.clone());
    Backend {
        content: Arc::new(HttpContentStore::new(document_http.clone())),
        collab: Arc::new(HttpCollabBackend::new(document_http)),
        kernels: Arc::new(HttpKernelApi::new(runtime_http, config.kernel_name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_are_prefixed() {
        assert_eq!(room_id_for("abc123"), "notebook:abc123");
    }

    #[test]
    fn networked_context_reports_mode() {
        let ctx = ServerContext::networked(Config::default());
        assert_eq!(ctx.mode(), "networked");
    }

    #[test]
    fn embedded_context_prefers_host_managers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            root_dir: Some(tmp.path().to_path_buf()),
            ..Config::default()
        };
        let ctx = ServerContext::embedded_in_process(config);
        assert_eq!(ctx.mode(), "embedded");
        // Selection is just a clone of the same trait objects.
        let a = ctx.select_backend();
        let b = ctx.select_backend();
        assert!(Arc::ptr_eq(&a.content, &b.content));
    }
}
