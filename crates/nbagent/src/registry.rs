//! Session registry: the table of notebooks in use.
//!
//! One mutex linearizes every registry mutation; no lock is held across
//! collaborator I/O. Kernel shutdown during removal is best-effort: cleanup
//! failures are logged and never fail the removal itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::backend::traits::{KernelApi, KernelHandle};
use crate::error::ToolError;

/// A named binding between a notebook path and a running kernel.
#[derive(Clone)]
pub struct Session {
    pub name: String,
    pub path: String,
    pub kernel: KernelHandle,
}

/// Snapshot row for `list_notebook`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub path: String,
    pub kernel_id: String,
    pub is_current: bool,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    current: Option<String>,
}

/// Registry of active sessions. At most one session is current; setting a new
/// current session clears the previous one in the same critical section.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Fails without side effects when the name is taken.
    pub async fn add(&self, session: Session) -> Result<(), ToolError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&session.name) {
            return Err(ToolError::DuplicateSession(session.name));
        }
        info!("[registry] Session '{}' -> {}", session.name, session.path);
        inner.sessions.insert(session.name.clone(), session);
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Session> {
        self.inner.lock().await.sessions.get(name).cloned()
    }

    /// Remove a session and stop its kernel best-effort. A second remove of
    /// the same name is a no-op returning `None`.
    ///
    /// The kernel stop happens after the registry lock is released; errors are
    /// swallowed because cleanup must not fail the removal.
    pub async fn remove(&self, name: &str, kernels: &dyn KernelApi) -> Option<Session> {
        let session = {
            let mut inner = self.inner.lock().await;
            let session = inner.sessions.remove(name)?;
            if inner.current.as_deref() == Some(name) {
                inner.current = None;
            }
            session
        };

        if let Err(e) = kernels.stop(&session.kernel).await {
            warn!(
                "[registry] Kernel cleanup failed for '{}' (ignored): {e}",
                name
            );
        }
        info!("[registry] Session '{name}' removed");
        Some(session)
    }

    /// Make `name` the current session. Returns false when absent.
    pub async fn set_current(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(name) {
            return false;
        }
        inner.current = Some(name.to_string());
        true
    }

    pub async fn current(&self) -> Option<Session> {
        let inner = self.inner.lock().await;
        let name = inner.current.as_ref()?;
        inner.sessions.get(name).cloned()
    }

    pub async fn current_name(&self) -> Option<String> {
        self.inner.lock().await.current.clone()
    }

    /// Replace the kernel handle stored for `name` (after a restart).
    pub async fn replace_kernel(&self, name: &str, kernel: KernelHandle) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(name) {
            Some(session) => {
                session.kernel = kernel;
                true
            }
            None => false,
        }
    }

    /// Return the session's kernel, replacing it through `factory` when the
    /// stored handle no longer reports alive. This is the single place that
    /// decides whether a kernel is still usable.
    pub async fn ensure_kernel_alive<F, Fut>(
        &self,
        name: &str,
        kernels: &dyn KernelApi,
        factory: F,
    ) -> Result<KernelHandle, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KernelHandle, ToolError>>,
    {
        let existing = self.get(name).await.ok_or_else(|| {
            ToolError::SessionNotFound(format!("Notebook '{name}' is not in use"))
        })?;

        if kernels.is_alive(&existing.kernel).await {
            return Ok(existing.kernel);
        }

        info!("[registry] Kernel for '{name}' is not alive, creating replacement");
        let fresh = factory().await?;
        self.replace_kernel(name, fresh.clone()).await;
        Ok(fresh)
    }

    /// Snapshot of all sessions, sorted by name.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SessionInfo> = inner
            .sessions
            .values()
            .map(|session| SessionInfo {
                name: session.name.clone(),
                path: session.path.clone(),
                kernel_id: session.kernel.id.clone(),
                is_current: inner.current.as_deref() == Some(session.name.as_str()),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.sessions.is_empty()
    }
}

/// Shared registry handle.
pub type SharedRegistry = Arc<SessionRegistry>;
