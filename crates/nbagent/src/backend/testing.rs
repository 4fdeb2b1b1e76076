//! Scripted kernel collaborators for tests.
//!
//! A [`ScriptedKernelApi`] launches no processes; its channels interpret a
//! tiny command language in the submitted code so tests can stage fast
//! results, slow executions, and incremental output streams:
//!
//! - `sleep <secs>`            — stay busy for that long, emit nothing
//! - `emit <n> <interval_ms>`  — n stream outputs, one per interval
//! - anything else             — echoed back as one execute_result

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Notify};

use crate::backend::traits::{
    BackendError, ExecStatus, KernelApi, KernelChannel, KernelEvent, KernelHandle, KernelInfo,
};

pub struct ScriptedKernelChannel {
    id: String,
    execution_count: AtomicI64,
    busy: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    pub interrupts: Arc<AtomicUsize>,
    interrupt_notify: Arc<Notify>,
}

impl ScriptedKernelChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            execution_count: AtomicI64::new(0),
            busy: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
            interrupts: Arc::new(AtomicUsize::new(0)),
            interrupt_notify: Arc::new(Notify::new()),
        }
    }

    /// Simulate a kernel process dying out from under its session.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn parse_script(code: &str) -> Script {
    let mut parts = code.split_whitespace();
    match parts.next() {
        Some("sleep") => {
            let secs: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1.0);
            Script::Sleep(Duration::from_secs_f64(secs))
        }
        Some("emit") => {
            let n: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
            let interval_ms: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(10);
            Script::Emit {
                n,
                interval: Duration::from_millis(interval_ms),
            }
        }
        _ => Script::Echo(code.to_string()),
    }
}

enum Script {
    Sleep(Duration),
    Emit { n: usize, interval: Duration },
    Echo(String),
}

#[async_trait]
impl KernelChannel for ScriptedKernelChannel {
    fn kernel_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, code: &str) -> Result<mpsc::Receiver<KernelEvent>, BackendError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BackendError::Kernel("kernel is dead".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        let script = parse_script(code);
        let interrupted = self.interrupt_notify.clone();

        self.busy.store(true, Ordering::SeqCst);
        let busy = self.busy.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(KernelEvent::Started {
                    execution_count: Some(count),
                })
                .await;

            let status = match script {
                Script::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => ExecStatus::Ok,
                        _ = interrupted.notified() => ExecStatus::Aborted,
                    }
                }
                Script::Emit { n, interval } => {
                    let mut status = ExecStatus::Ok;
                    for i in 0..n {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = interrupted.notified() => {
                                status = ExecStatus::Aborted;
                                break;
                            }
                        }
                        let _ = tx
                            .send(KernelEvent::Output(json!({
                                "output_type": "stream",
                                "name": "stdout",
                                "text": format!("chunk {i}\n"),
                            })))
                            .await;
                    }
                    status
                }
                Script::Echo(code) => {
                    let _ = tx
                        .send(KernelEvent::Output(json!({
                            "output_type": "execute_result",
                            "data": {"text/plain": code},
                            "metadata": {},
                            "execution_count": count,
                        })))
                        .await;
                    ExecStatus::Ok
                }
            };

            let _ = tx.send(KernelEvent::Done(status)).await;
            busy.store(false, Ordering::SeqCst);
        });
        Ok(rx)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt_notify.notify_waiters();
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Kernel manager whose kernels are scripted channels.
#[derive(Default)]
pub struct ScriptedKernelApi {
    started: AtomicUsize,
    pub stopped: AtomicUsize,
    channels: std::sync::Mutex<Vec<(String, Arc<ScriptedKernelChannel>)>>,
}

impl ScriptedKernelApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn channel(&self, kernel_id: &str) -> Option<Arc<ScriptedKernelChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == kernel_id)
            .map(|(_, ch)| ch.clone())
    }
}

#[async_trait]
impl KernelApi for ScriptedKernelApi {
    async fn start(&self) -> Result<String, BackendError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        let id = format!("scripted-{n}");
        let channel = Arc::new(ScriptedKernelChannel::new(id.clone()));
        self.channels.lock().unwrap().push((id.clone(), channel));
        Ok(id)
    }

    async fn get(&self, kernel_id: &str) -> Result<KernelHandle, BackendError> {
        self.channel(kernel_id)
            .map(|channel| KernelHandle::new(channel))
            .ok_or_else(|| BackendError::NotFound(format!("kernel '{kernel_id}' not found")))
    }

    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        kernel.channel.interrupt().await
    }

    async fn is_alive(&self, kernel: &KernelHandle) -> bool {
        kernel.channel.is_alive().await
    }

    async fn stop(&self, kernel: &KernelHandle) -> Result<(), BackendError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        kernel.channel.shutdown().await
    }

    async fn list(&self) -> Result<Vec<KernelInfo>, BackendError> {
        let channels = self.channels.lock().unwrap();
        let mut infos = Vec::new();
        for (id, channel) in channels.iter() {
            infos.push(KernelInfo {
                id: id.clone(),
                name: "scripted".to_string(),
                state: if !channel.alive.load(Ordering::SeqCst) {
                    "dead".to_string()
                } else if channel.is_idle() {
                    "idle".to_string()
                } else {
                    "busy".to_string()
                },
                connections: "1".to_string(),
                last_activity: "unknown".to_string(),
            });
        }
        Ok(infos)
    }
}
