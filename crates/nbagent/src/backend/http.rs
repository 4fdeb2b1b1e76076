//! Networked collaborators: Jupyter REST APIs over HTTP and kernel channels
//! over WebSocket.
//!
//! Used when the coordinator runs as a separate process. Connection-level
//! failures map to `BackendError::Unreachable` so the retry helper can
//! distinguish them from application errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::backend::traits::{
    BackendError, CollabBackend, ContentEntry, ContentStore, ExecStatus, KernelApi, KernelChannel,
    KernelEvent, KernelHandle, KernelInfo, LiveDoc,
};

/// Shared REST plumbing: base URL, token, error mapping.
#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("token {token}")),
            None => req,
        }
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(format!("{what}: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(format!("{what}: not found")));
        }
        if !status.is_success() {
            return Err(BackendError::Protocol(format!("{what}: HTTP {status}")));
        }
        Ok(response)
    }

    async fn get_json(&self, path: &str, what: &str) -> Result<Value, BackendError> {
        let response = self.send(self.client.get(self.url(path)), what).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("{what}: {e}")))
    }
}

// ── Content store ───────────────────────────────────────────────────

pub struct HttpContentStore {
    http: HttpClient,
}

impl HttpContentStore {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn get(&self, path: &str) -> Result<String, BackendError> {
        let model = self
            .http
            .get_json(&format!("api/contents/{path}?content=1"), "contents get")
            .await?;
        let content = model
            .get("content")
            .filter(|c| !c.is_null())
            .ok_or_else(|| BackendError::Protocol(format!("no content for '{path}'")))?;
        serde_json::to_string_pretty(content)
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn save(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let parsed: Value = serde_json::from_str(content)
            .map_err(|e| BackendError::Protocol(format!("notebook is not valid JSON: {e}")))?;
        let body = json!({
            "type": "notebook",
            "format": "json",
            "content": parsed,
        });
        self.http
            .send(
                self.http
                    .client
                    .put(self.http.url(&format!("api/contents/{path}")))
                    .json(&body),
                "contents save",
            )
            .await?;
        Ok(())
    }

    async fn create(&self, path: &str) -> Result<(), BackendError> {
        let body = json!({"type": "notebook"});
        self.http
            .send(
                self.http
                    .client
                    .put(self.http.url(&format!("api/contents/{path}")))
                    .json(&body),
                "contents create",
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.http
            .send(
                self.http
                    .client
                    .delete(self.http.url(&format!("api/contents/{path}"))),
                "contents delete",
            )
            .await?;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<ContentEntry>, BackendError> {
        let model = self
            .http
            .get_json(&format!("api/contents/{path}"), "contents list")
            .await?;
        let items = model
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::Protocol(format!("'{path}' is not a directory")))?;

        let entries = items
            .iter()
            .map(|item| {
                let get_str =
                    |key: &str| item.get(key).and_then(Value::as_str).unwrap_or_default();
                ContentEntry {
                    name: get_str("name").to_string(),
                    path: get_str("path").to_string(),
                    kind: get_str("type").to_string(),
                    size: item.get("size").and_then(Value::as_u64),
                    last_modified: item
                        .get("last_modified")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            })
            .collect();
        Ok(entries)
    }

    async fn id_for(&self, path: &str) -> Result<String, BackendError> {
        // The contents API has no stable file-id endpoint; the server-relative
        // path is the stable identifier in networked mode.
        Ok(path.to_string())
    }
}

// ── Collaboration backend ───────────────────────────────────────────

pub struct HttpCollabBackend {
    http: HttpClient,
}

impl HttpCollabBackend {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CollabBackend for HttpCollabBackend {
    async fn has_room(&self, room_id: &str) -> Result<bool, BackendError> {
        let path = room_id.strip_prefix("notebook:").unwrap_or(room_id);
        match self
            .http
            .get_json(&format!("api/collaboration/session/{path}"), "collab probe")
            .await
        {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_room(&self, room_id: &str) -> Result<Arc<dyn LiveDoc>, BackendError> {
        // Attaching to a networked room needs the document sync client, which
        // lives outside this coordinator. Reporting the room unavailable makes
        // the resolver take the file-backed path.
        Err(BackendError::Room(format!(
            "no document sync client for networked room {room_id}"
        )))
    }
}

// ── Kernels ─────────────────────────────────────────────────────────

/// Per-execution event sender registered under the execute_request msg_id.
type PendingMap = Arc<StdMutex<HashMap<String, mpsc::Sender<KernelEvent>>>>;

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

/// Kernel channel over the server's kernel WebSocket endpoint.
pub struct WsKernelChannel {
    kernel_id: String,
    session_id: String,
    http: HttpClient,
    sink: Mutex<WsSink>,
    pending: PendingMap,
    busy: Arc<AtomicBool>,
    reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsKernelChannel {
    pub async fn connect(http: HttpClient, kernel_id: &str) -> Result<Self, BackendError> {
        let session_id = Uuid::new_v4().to_string();
        let ws_base = http
            .base_url()
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let mut ws_url = format!("{ws_base}/api/kernels/{kernel_id}/channels?session_id={session_id}");
        if let Some(token) = http.token() {
            ws_url.push_str(&format!("&token={token}"));
        }

        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| BackendError::Unreachable(format!("kernel channel connect: {e}")))?;
        let (sink, mut source) = stream.split();

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let busy = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_busy = busy.clone();
        let reader_kernel_id = kernel_id.to_string();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            route_ws_message(&value, &reader_pending, &reader_busy);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("[ws-kernel] {reader_kernel_id}: channel closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("[ws-kernel] {reader_kernel_id}: read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            kernel_id: kernel_id.to_string(),
            session_id,
            http,
            sink: Mutex::new(sink),
            pending,
            busy,
            reader_task: StdMutex::new(Some(reader_task)),
        })
    }
}

/// Route one wire message to the execution that requested it.
fn route_ws_message(message: &Value, pending: &PendingMap, busy: &AtomicBool) {
    let msg_type = message
        .pointer("/header/msg_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let parent_msg_id = message
        .pointer("/parent_header/msg_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = message.get("content").cloned().unwrap_or(Value::Null);

    let sender = parent_msg_id.as_ref().and_then(|id| {
        pending
            .lock()
            .ok()
            .and_then(|map| map.get(id).cloned())
    });

    match msg_type {
        "status" => {
            let state = content
                .get("execution_state")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match state {
                "busy" => busy.store(true, Ordering::SeqCst),
                "idle" => busy.store(false, Ordering::SeqCst),
                _ => {}
            }
            if state == "idle" {
                if let (Some(msg_id), Some(sender)) = (parent_msg_id, sender) {
                    let _ = sender.try_send(KernelEvent::Done(ExecStatus::Ok));
                    if let Ok(mut map) = pending.lock() {
                        map.remove(&msg_id);
                    }
                }
            }
        }
        "execute_input" => {
            if let Some(sender) = sender {
                let _ = sender.try_send(KernelEvent::Started {
                    execution_count: content.get("execution_count").and_then(Value::as_i64),
                });
            }
        }
        "stream" => {
            if let Some(sender) = sender {
                let _ = sender.try_send(KernelEvent::Output(json!({
                    "output_type": "stream",
                    "name": content.get("name").cloned().unwrap_or(Value::Null),
                    "text": content.get("text").cloned().unwrap_or(Value::Null),
                })));
            }
        }
        "display_data" | "execute_result" => {
            if let Some(sender) = sender {
                let mut output = json!({
                    "output_type": msg_type,
                    "data": content.get("data").cloned().unwrap_or(json!({})),
                    "metadata": content.get("metadata").cloned().unwrap_or(json!({})),
                });
                if msg_type == "execute_result" {
                    output["execution_count"] =
                        content.get("execution_count").cloned().unwrap_or(Value::Null);
                }
                if let Some(transient) = content.get("transient") {
                    output["transient"] = transient.clone();
                }
                let _ = sender.try_send(KernelEvent::Output(output));
            }
        }
        "error" => {
            if let Some(sender) = sender {
                let _ = sender.try_send(KernelEvent::Output(json!({
                    "output_type": "error",
                    "ename": content.get("ename").cloned().unwrap_or(Value::Null),
                    "evalue": content.get("evalue").cloned().unwrap_or(Value::Null),
                    "traceback": content.get("traceback").cloned().unwrap_or(json!([])),
                })));
            }
        }
        other => {
            debug!("[ws-kernel] Unhandled message type: {other}");
        }
    }
}

#[async_trait]
impl KernelChannel for WsKernelChannel {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn execute(&self, code: &str) -> Result<mpsc::Receiver<KernelEvent>, BackendError> {
        let msg_id = Uuid::new_v4().to_string();
        let message = json!({
            "header": {
                "msg_id": msg_id,
                "username": "nbagent",
                "session": self.session_id,
                "msg_type": "execute_request",
                "version": "5.3",
                "date": chrono::Utc::now().to_rfc3339(),
            },
            "parent_header": {},
            "metadata": {},
            "content": {
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            },
            "channel": "shell",
            "buffers": [],
        });

        let (tx, rx) = mpsc::channel::<KernelEvent>(256);
        self.pending
            .lock()
            .map_err(|_| BackendError::Kernel("pending map lock poisoned".into()))?
            .insert(msg_id.clone(), tx);

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(message.to_string())).await {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&msg_id);
            }
            return Err(BackendError::Unreachable(format!("kernel channel send: {e}")));
        }
        debug!(
            "[ws-kernel] {}: sent execute_request msg_id={msg_id}",
            self.kernel_id
        );
        Ok(rx)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.http
            .send(
                self.http
                    .client
                    .post(self.http.url(&format!("api/kernels/{}/interrupt", self.kernel_id))),
                "kernel interrupt",
            )
            .await?;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.http
            .get_json(&format!("api/kernels/{}", self.kernel_id), "kernel status")
            .await
            .is_ok()
    }

    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        Ok(())
    }
}

impl Drop for WsKernelChannel {
    fn drop(&mut self) {
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Kernel management through the server's kernels REST API.
pub struct HttpKernelApi {
    http: HttpClient,
    kernel_name: String,
}

impl HttpKernelApi {
    pub fn new(http: HttpClient, kernel_name: impl Into<String>) -> Self {
        Self {
            http,
            kernel_name: kernel_name.into(),
        }
    }
}

#[async_trait]
impl KernelApi for HttpKernelApi {
    async fn start(&self) -> Result<String, BackendError> {
        let body = json!({"name": self.kernel_name});
        let response = self
            .http
            .send(
                self.http
                    .client
                    .post(self.http.url("api/kernels"))
                    .json(&body),
                "kernel start",
            )
            .await?;
        let model: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("kernel start: {e}")))?;
        model
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("kernel start: no id in response".into()))
    }

    async fn get(&self, kernel_id: &str) -> Result<KernelHandle, BackendError> {
        // Confirm the kernel exists before paying for the channel connect.
        self.http
            .get_json(&format!("api/kernels/{kernel_id}"), "kernel get")
            .await?;
        let channel = WsKernelChannel::connect(self.http.clone(), kernel_id).await?;
        Ok(KernelHandle::new(Arc::new(channel)))
    }

    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        kernel.channel.interrupt().await
    }

    async fn is_alive(&self, kernel: &KernelHandle) -> bool {
        kernel.channel.is_alive().await
    }

    async fn stop(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        if let Err(e) = kernel.channel.shutdown().await {
            warn!("[http-kernels] channel close failed for {}: {e}", kernel.id);
        }
        self.http
            .send(
                self.http
                    .client
                    .delete(self.http.url(&format!("api/kernels/{}", kernel.id))),
                "kernel stop",
            )
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<KernelInfo>, BackendError> {
        let kernels = self.http.get_json("api/kernels", "kernel list").await?;
        let items = kernels
            .as_array()
            .ok_or_else(|| BackendError::Protocol("kernel list: expected array".into()))?;

        let infos = items
            .iter()
            .map(|item| {
                let get_str = |key: &str| {
                    item.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string()
                };
                KernelInfo {
                    id: get_str("id"),
                    name: get_str("name"),
                    state: get_str("execution_state"),
                    connections: item
                        .get("connections")
                        .and_then(Value::as_u64)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    last_activity: get_str("last_activity"),
                }
            })
            .collect();
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_handles_slashes() {
        let http = HttpClient::new("http://localhost:8888/", None);
        assert_eq!(http.url("/api/kernels"), "http://localhost:8888/api/kernels");
        assert_eq!(http.url("api/kernels"), "http://localhost:8888/api/kernels");
    }

    #[test]
    fn ws_stream_message_routes_to_pending() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(8);
        pending.lock().unwrap().insert("msg-1".to_string(), tx);

        let message = json!({
            "header": {"msg_type": "stream", "msg_id": "x"},
            "parent_header": {"msg_id": "msg-1"},
            "channel": "iopub",
            "content": {"name": "stdout", "text": "hi\n"},
        });
        route_ws_message(&message, &pending, &busy);

        match rx.try_recv().unwrap() {
            KernelEvent::Output(output) => {
                assert_eq!(output["output_type"], "stream");
                assert_eq!(output["text"], "hi\n");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn idle_status_completes_and_unregisters() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let busy = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel(8);
        pending.lock().unwrap().insert("msg-1".to_string(), tx);

        let message = json!({
            "header": {"msg_type": "status", "msg_id": "x"},
            "parent_header": {"msg_id": "msg-1"},
            "content": {"execution_state": "idle"},
        });
        route_ws_message(&message, &pending, &busy);

        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::Done(ExecStatus::Ok)
        ));
        assert!(!busy.load(Ordering::SeqCst));
        assert!(pending.lock().unwrap().is_empty());
    }
}
