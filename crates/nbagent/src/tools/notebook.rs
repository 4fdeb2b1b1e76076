//! Session-level tools: connect, disconnect, restart, switch, list.

use std::path::Path;

use log::{info, warn};

use super::{NotebookNameArgs, ToolOutput, Toolbox, UseNotebookArgs};
use crate::backend::traits::KernelHandle;
use crate::backend::Backend;
use crate::doc::DocumentTarget;
use crate::error::ToolError;
use crate::registry::Session;

impl Toolbox {
    /// The current session, or a validation error directing the caller to
    /// connect first.
    pub(crate) async fn current_session(&self) -> Result<Session, ToolError> {
        self.registry.current().await.ok_or_else(|| {
            ToolError::SessionNotFound(
                "No notebook is currently in use. Connect one with use_notebook first.".to_string(),
            )
        })
    }

    /// Resolve the current session's document, fresh for this operation.
    pub(crate) async fn resolve_current(
        &self,
    ) -> Result<(Session, DocumentTarget), ToolError> {
        let session = self.current_session().await?;
        let backend = self.ctx.select_backend();
        let doc = self.resolver.resolve(&backend, &session.path).await?;
        Ok((session, doc))
    }

    /// Start a fresh kernel through the selected backend.
    pub(crate) async fn start_kernel(&self, backend: &Backend) -> Result<KernelHandle, ToolError> {
        let kernel_id = backend.kernels.start().await?;
        Ok(backend.kernels.get(&kernel_id).await?)
    }

    pub(crate) async fn use_notebook(
        &self,
        args: UseNotebookArgs,
    ) -> Result<ToolOutput, ToolError> {
        let name = args.notebook_name;
        if self.registry.contains(&name).await {
            return Ok(ToolOutput::Message(format!(
                "Notebook '{name}' is already in use. Use unuse_notebook first if you want to reconnect."
            )));
        }
        if args.mode != "connect" && args.mode != "create" {
            return Err(ToolError::Internal(format!(
                "invalid mode '{}': expected \"connect\" or \"create\"",
                args.mode
            )));
        }

        let path = args
            .notebook_path
            .unwrap_or_else(|| self.ctx.config.document_id.clone());
        let backend = self.ctx.select_backend();

        // Check the path before any side effect.
        let parent = Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| p != ".")
            .unwrap_or_default();
        let file_name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        match backend.content.list(&parent).await {
            Ok(entries) => {
                let exists = entries.iter().any(|e| e.name == file_name);
                if args.mode == "connect" && !exists {
                    return Ok(ToolOutput::Message(format!(
                        "'{path}' not found on the server, please check the notebook already exists."
                    )));
                }
            }
            Err(crate::backend::traits::BackendError::Unreachable(msg)) => {
                return Err(ToolError::BackendUnreachable(msg));
            }
            Err(_) => {
                let shown = if parent.is_empty() {
                    "root directory"
                } else {
                    parent.as_str()
                };
                return Ok(ToolOutput::Message(format!(
                    "'{shown}' not found on the server, please check the directory path already exists."
                )));
            }
        }

        if args.mode == "create" {
            backend.content.create(&path).await?;
        }

        let kernel = match &args.kernel_id {
            Some(kernel_id) => match backend.kernels.get(kernel_id).await {
                Ok(handle) => handle,
                Err(crate::backend::traits::BackendError::NotFound(_)) => {
                    return Ok(ToolOutput::Message(format!(
                        "Kernel '{kernel_id}' not found on the server, please check the kernel already exists."
                    )));
                }
                Err(e) => return Err(e.into()),
            },
            None => self.start_kernel(&backend).await?,
        };

        self.registry
            .add(Session {
                name: name.clone(),
                path: path.clone(),
                kernel,
            })
            .await?;
        self.registry.set_current(&name).await;

        let created = if args.mode == "create" { "created and " } else { "" };
        info!("[tools] Using notebook '{name}' at '{path}'");
        Ok(ToolOutput::Message(format!(
            "Successfully {created}using notebook '{name}' at path '{path}' in {} mode.",
            self.ctx.mode()
        )))
    }

    pub(crate) async fn unuse_notebook(
        &self,
        args: NotebookNameArgs,
    ) -> Result<ToolOutput, ToolError> {
        let name = args.notebook_name;
        let backend = self.ctx.select_backend();
        match self.registry.remove(&name, backend.kernels.as_ref()).await {
            Some(_) => Ok(ToolOutput::Message(format!(
                "Notebook '{name}' has been disconnected and its kernel shut down."
            ))),
            None => Err(ToolError::SessionNotFound(format!(
                "Notebook '{name}' is not in use"
            ))),
        }
    }

    pub(crate) async fn restart_notebook(
        &self,
        args: NotebookNameArgs,
    ) -> Result<ToolOutput, ToolError> {
        let name = args.notebook_name;
        let session = self.registry.get(&name).await.ok_or_else(|| {
            ToolError::SessionNotFound(format!("Notebook '{name}' is not in use"))
        })?;

        let backend = self.ctx.select_backend();
        // Old handle is discarded even when shutdown fails; cleanup must not
        // block the restart.
        if let Err(e) = backend.kernels.stop(&session.kernel).await {
            warn!("[tools] Kernel shutdown during restart failed (ignored): {e}");
        }

        let fresh = self.start_kernel(&backend).await?;
        self.registry.replace_kernel(&name, fresh).await;
        Ok(ToolOutput::Message(format!(
            "Notebook '{name}' kernel restarted successfully."
        )))
    }

    pub(crate) async fn switch_notebook(
        &self,
        args: NotebookNameArgs,
    ) -> Result<ToolOutput, ToolError> {
        let name = args.notebook_name;
        if !self.registry.set_current(&name).await {
            return Err(ToolError::SessionNotFound(format!(
                "Notebook '{name}' is not in use"
            )));
        }
        let session = self.current_session().await?;
        Ok(ToolOutput::Message(format!(
            "Switched to notebook '{name}' at path '{}'.",
            session.path
        )))
    }

    pub(crate) async fn list_notebook(&self) -> Result<ToolOutput, ToolError> {
        let rows = self.registry.list().await;
        if rows.is_empty() {
            return Ok(ToolOutput::Message(
                "No notebooks are currently in use.".to_string(),
            ));
        }

        let mut lines = vec!["Name\tPath\tKernel\tCurrent".to_string(), "-".repeat(60)];
        for row in rows {
            lines.push(format!(
                "{}\t{}\t{}\t{}",
                row.name,
                row.path,
                row.kernel_id,
                if row.is_current { "yes" } else { "-" }
            ));
        }
        Ok(ToolOutput::Message(lines.join("\n")))
    }
}
