//! Server-wide tools: kernel listing and recursive file listing.

use std::collections::VecDeque;

use super::{ListFilesArgs, ToolOutput, Toolbox};
use crate::error::ToolError;
use crate::retry::{with_connection_retry, DEFAULT_MAX_ATTEMPTS};

fn format_size(size: Option<u64>) -> String {
    match size {
        None => String::new(),
        Some(n) if n < 1024 => format!("{n}B"),
        Some(n) if n < 1024 * 1024 => format!("{}KB", n / 1024),
        Some(n) => format!("{}MB", n / (1024 * 1024)),
    }
}

impl Toolbox {
    pub(crate) async fn list_kernel(&self) -> Result<ToolOutput, ToolError> {
        with_connection_retry("list_kernel", DEFAULT_MAX_ATTEMPTS, || async {
            let backend = self.ctx.select_backend();
            let kernels = backend.kernels.list().await?;
            if kernels.is_empty() {
                return Ok(ToolOutput::Message(
                    "No kernels found on the server.".to_string(),
                ));
            }

            let mut lines = vec![
                "ID\tName\tState\tConnections\tLast_Activity".to_string(),
                "-".repeat(60),
            ];
            for kernel in kernels {
                lines.push(format!(
                    "{}\t{}\t{}\t{}\t{}",
                    kernel.id, kernel.name, kernel.state, kernel.connections, kernel.last_activity
                ));
            }
            Ok(ToolOutput::Message(lines.join("\n")))
        })
        .await
    }

    pub(crate) async fn list_files(&self, args: ListFilesArgs) -> Result<ToolOutput, ToolError> {
        with_connection_retry("list_files", DEFAULT_MAX_ATTEMPTS, || async {
            let backend = self.ctx.select_backend();
            let mut lines = vec![
                "Path\tType\tSize\tLast_Modified".to_string(),
                "-".repeat(60),
            ];

            // Breadth-first walk bounded by max_depth.
            let mut queue: VecDeque<(String, usize)> = VecDeque::new();
            queue.push_back((args.path.clone(), 0));
            let mut rows = 0usize;

            while let Some((dir, depth)) = queue.pop_front() {
                let entries = match backend.content.list(&dir).await {
                    Ok(entries) => entries,
                    Err(crate::backend::traits::BackendError::Unreachable(msg)) => {
                        return Err(ToolError::BackendUnreachable(msg));
                    }
                    Err(e) => {
                        let shown = if dir.is_empty() { "root" } else { dir.as_str() };
                        lines.push(format!("{shown}\terror\t\t{e}"));
                        continue;
                    }
                };
                for entry in entries {
                    lines.push(format!(
                        "{}\t{}\t{}\t{}",
                        entry.path,
                        entry.kind,
                        format_size(entry.size),
                        entry.last_modified.as_deref().unwrap_or("")
                    ));
                    rows += 1;
                    if entry.kind == "directory" && depth + 1 <= args.max_depth {
                        queue.push_back((entry.path, depth + 1));
                    }
                }
            }

            if rows == 0 {
                return Ok(ToolOutput::Message("No files found.".to_string()));
            }
            Ok(ToolOutput::Message(lines.join("\n")))
        })
        .await
    }
}
