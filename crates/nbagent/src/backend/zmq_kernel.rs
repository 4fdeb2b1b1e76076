//! Embedded kernel management over ZMQ.
//!
//! Launches kernel processes from kernelspecs and speaks the Jupyter wire
//! protocol directly through `runtimelib` connections. One iopub router task
//! per kernel forwards execution events to whichever execution registered the
//! request's msg_id.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::backend::traits::{
    BackendError, ExecStatus, KernelApi, KernelChannel, KernelEvent, KernelHandle, KernelInfo,
};

/// Convert an iopub message payload to nbformat-style output JSON.
///
/// jupyter_protocol serializes as `{"ExecuteResult": {...}}`; nbformat wants
/// `{"output_type": "execute_result", ...}`.
fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<serde_json::Value> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => {
            let mut output = json!({
                "output_type": "display_data",
                "data": data.data,
                "metadata": data.metadata
            });
            if let Some(ref transient) = data.transient {
                if let Some(ref display_id) = transient.display_id {
                    output["transient"] = json!({ "display_id": display_id });
                }
            }
            Some(output)
        }
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

/// Map any collaborator error into the kernel error class.
fn kerr<E: std::fmt::Display>(e: E) -> BackendError {
    BackendError::Kernel(e.to_string())
}

/// Per-execution event sender registered under the execute_request msg_id.
type PendingMap = Arc<StdMutex<HashMap<String, mpsc::Sender<KernelEvent>>>>;

/// One kernel process owned by the embedded backend.
pub struct ZmqKernel {
    kernel_id: String,
    session_id: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    started_at: String,
    process: Mutex<tokio::process::Child>,
    shell: Mutex<runtimelib::DealerSendConnection>,
    pending: PendingMap,
    busy: Arc<AtomicBool>,
    iopub_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    shell_drain_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ZmqKernel {
    /// Launch a kernel from the named kernelspec and wait until it answers a
    /// kernel_info request.
    pub async fn launch(kernel_name: &str) -> Result<Self, BackendError> {
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await.map_err(kerr)?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("nbagent-kernel-{kernel_id}.json"));
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)
                .map_err(|e| BackendError::Protocol(e.to_string()))?,
        )
        .await?;

        info!("[zmq-kernel] Starting {kernel_name} kernel {kernel_id}");
        let kernelspec = runtimelib::find_kernelspec(kernel_name)
            .await
            .map_err(kerr)?;
        let mut cmd = kernelspec
            .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))
            .map_err(kerr)?;
        let process = cmd.kill_on_drop(true).spawn()?;

        // Give the kernel a moment to bind its sockets.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let session_id = Uuid::new_v4().to_string();
        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
                .await
                .map_err(kerr)?;

        let identity = runtimelib::peer_identity_for_session(&session_id).map_err(kerr)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await
        .map_err(kerr)?;

        // Verify the kernel is alive before handing the channel out.
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(kerr)?;
        match tokio::time::timeout(std::time::Duration::from_secs(30), shell.read()).await {
            Ok(Ok(msg)) => {
                debug!("[zmq-kernel] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                return Err(BackendError::Kernel(format!("kernel did not respond: {e}")));
            }
            Err(_) => {
                return Err(BackendError::Kernel(
                    "kernel did not respond within 30s".to_string(),
                ));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let busy = Arc::new(AtomicBool::new(false));

        let iopub_pending = pending.clone();
        let iopub_busy = busy.clone();
        let iopub_kernel_id = kernel_id.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        route_iopub(&message, &iopub_pending, &iopub_busy);
                    }
                    Err(e) => {
                        error!("[zmq-kernel] {iopub_kernel_id}: iopub read error: {e}");
                        break;
                    }
                }
            }
        });

        // Replies on the shell channel are drained so the socket never backs
        // up; completion is driven by iopub status messages.
        let drain_kernel_id = kernel_id.clone();
        let shell_drain_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        debug!(
                            "[zmq-kernel] {drain_kernel_id}: shell reply type={}",
                            msg.header.msg_type
                        );
                    }
                    Err(e) => {
                        error!("[zmq-kernel] {drain_kernel_id}: shell read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            kernel_id,
            session_id,
            connection_info,
            connection_file,
            started_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            process: Mutex::new(process),
            shell: Mutex::new(shell_writer),
            pending,
            busy,
            iopub_task: StdMutex::new(Some(iopub_task)),
            shell_drain_task: StdMutex::new(Some(shell_drain_task)),
        })
    }

    fn abort_tasks(&self) {
        if let Ok(mut task) = self.iopub_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut task) = self.shell_drain_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn route_iopub(message: &JupyterMessage, pending: &PendingMap, busy: &AtomicBool) {
    let parent_msg_id = message.parent_header.as_ref().map(|h| h.msg_id.clone());
    let sender = parent_msg_id.as_ref().and_then(|id| {
        pending
            .lock()
            .ok()
            .and_then(|map| map.get(id).cloned())
    });

    match &message.content {
        JupyterMessageContent::Status(status) => {
            match status.execution_state {
                jupyter_protocol::ExecutionState::Busy => busy.store(true, Ordering::SeqCst),
                jupyter_protocol::ExecutionState::Idle => busy.store(false, Ordering::SeqCst),
                _ => {}
            }
            if status.execution_state == jupyter_protocol::ExecutionState::Idle {
                if let (Some(msg_id), Some(sender)) = (parent_msg_id, sender) {
                    let _ = sender.try_send(KernelEvent::Done(ExecStatus::Ok));
                    if let Ok(mut map) = pending.lock() {
                        map.remove(&msg_id);
                    }
                }
            }
        }
        JupyterMessageContent::ExecuteInput(input) => {
            if let Some(sender) = sender {
                let _ = sender.try_send(KernelEvent::Started {
                    execution_count: Some(input.execution_count.0 as i64),
                });
            }
        }
        JupyterMessageContent::StreamContent(_)
        | JupyterMessageContent::DisplayData(_)
        | JupyterMessageContent::ExecuteResult(_)
        | JupyterMessageContent::ErrorOutput(_) => {
            if let Some(sender) = sender {
                if let Some(output) = message_content_to_nbformat(&message.content) {
                    let _ = sender.try_send(KernelEvent::Output(output));
                }
            }
        }
        _ => {
            debug!(
                "[zmq-kernel] Unhandled iopub message: {}",
                message.header.msg_type
            );
        }
    }
}

#[async_trait]
impl KernelChannel for ZmqKernel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn execute(&self, code: &str) -> Result<mpsc::Receiver<KernelEvent>, BackendError> {
        let request = ExecuteRequest::new(code.to_string());
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        let (tx, rx) = mpsc::channel::<KernelEvent>(256);

        // Register before sending so no event can be missed.
        self.pending
            .lock()
            .map_err(|_| BackendError::Kernel("pending map lock poisoned".into()))?
            .insert(msg_id.clone(), tx);

        let mut shell = self.shell.lock().await;
        if let Err(e) = shell.send(message).await {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&msg_id);
            }
            return Err(BackendError::Kernel(e.to_string()));
        }
        debug!(
            "[zmq-kernel] {}: sent execute_request msg_id={msg_id}",
            self.kernel_id
        );
        Ok(rx)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await
                .map_err(|e| BackendError::Kernel(e.to_string()))?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control
            .send(request)
            .await
            .map_err(|e| BackendError::Kernel(e.to_string()))?;
        info!("[zmq-kernel] {}: sent interrupt_request", self.kernel_id);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        info!("[zmq-kernel] {}: shutting down", self.kernel_id);
        self.abort_tasks();

        {
            let mut shell = self.shell.lock().await;
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            let _ = shell.send(request).await;
        }

        let mut process = self.process.lock().await;
        let _ = process.start_kill();
        let _ = tokio::fs::remove_file(&self.connection_file).await;

        if let Ok(mut map) = self.pending.lock() {
            map.clear();
        }
        Ok(())
    }
}

impl Drop for ZmqKernel {
    fn drop(&mut self) {
        self.abort_tasks();
        let _ = std::fs::remove_file(&self.connection_file);
    }
}

/// One row in the embedded kernel table.
#[derive(Clone)]
struct KernelEntry {
    handle: KernelHandle,
    started_at: String,
}

/// The embedded kernel process manager: the table of kernels this process
/// launched, keyed by kernel id.
pub struct LocalKernelApi {
    kernel_name: String,
    kernels: StdMutex<HashMap<String, KernelEntry>>,
}

impl LocalKernelApi {
    pub fn new(kernel_name: impl Into<String>) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            kernels: StdMutex::new(HashMap::new()),
        }
    }

    fn kernels(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, KernelEntry>>, BackendError> {
        self.kernels
            .lock()
            .map_err(|_| BackendError::Kernel("kernel table lock poisoned".into()))
    }
}

impl Default for LocalKernelApi {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl KernelApi for LocalKernelApi {
    async fn start(&self) -> Result<String, BackendError> {
        let kernel = ZmqKernel::launch(&self.kernel_name).await?;
        let id = kernel.kernel_id.clone();
        let started_at = kernel.started_at.clone();
        let handle = KernelHandle::new(Arc::new(kernel));
        self.kernels()?
            .insert(id.clone(), KernelEntry { handle, started_at });
        Ok(id)
    }

    async fn get(&self, kernel_id: &str) -> Result<KernelHandle, BackendError> {
        self.kernels()?
            .get(kernel_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| BackendError::NotFound(format!("kernel '{kernel_id}' not found")))
    }

    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        kernel.channel.interrupt().await
    }

    async fn is_alive(&self, kernel: &KernelHandle) -> bool {
        kernel.channel.is_alive().await
    }

    async fn stop(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        let result = kernel.channel.shutdown().await;
        self.kernels()?.remove(&kernel.id);
        result
    }

    async fn list(&self) -> Result<Vec<KernelInfo>, BackendError> {
        let entries: Vec<KernelEntry> = self.kernels()?.values().cloned().collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = if !entry.handle.channel.is_alive().await {
                "dead"
            } else if entry.handle.channel.is_idle() {
                "idle"
            } else {
                "busy"
            };
            infos.push(KernelInfo {
                id: entry.handle.id.clone(),
                name: self.kernel_name.clone(),
                state: state.to_string(),
                connections: "1".to_string(),
                last_activity: entry.started_at,
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_output_converts_to_nbformat() {
        let content = JupyterMessageContent::StreamContent(jupyter_protocol::StreamContent {
            name: jupyter_protocol::Stdio::Stdout,
            text: "hello\n".to_string(),
        });
        let value = message_content_to_nbformat(&content).unwrap();
        assert_eq!(value["output_type"], "stream");
        assert_eq!(value["name"], "stdout");
        assert_eq!(value["text"], "hello\n");
    }

    #[tokio::test]
    async fn get_unknown_kernel_is_not_found() {
        let api = LocalKernelApi::default();
        assert!(matches!(
            api.get("missing").await,
            Err(BackendError::NotFound(_))
        ));
    }
}
