//! Cell execution under a bounded time budget.
//!
//! Three strategies share one cancellable core: a kernel event stream drained
//! into the resolved document, observed from the outside by a deadline and an
//! optional periodic poll. On deadline expiry the engine cancels the stream,
//! then sends a kernel interrupt; both are best-effort and a failed interrupt
//! never changes the reported error class. Outputs already received are never
//! discarded.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::traits::{DocChange, KernelChannel, KernelEvent, KernelHandle};
use crate::doc::DocumentTarget;
use crate::error::ToolError;
use crate::outputs::{extract_output, safe_extract_outputs, OutputItem};

/// Timeout/progress policy for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Wait up to the deadline, no intermediate feedback.
    BoundedWait,
    /// Poll the document every second, logging newly appeared outputs with
    /// elapsed-time tags and a coarser periodic progress marker.
    ProgressStream,
    /// Poll at the same interval, but to proactively trigger document sync so
    /// output reaches other viewers early. Raises a typed timeout error.
    ForcedSync,
}

/// Ephemeral per-call request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub timeout: Duration,
    pub strategy: Strategy,
    /// Seconds between progress markers in the streamed log.
    pub progress_interval: u64,
}

impl ExecutionRequest {
    pub fn new(timeout: Duration, strategy: Strategy) -> Self {
        Self {
            timeout,
            strategy,
            progress_interval: 5,
        }
    }
}

/// Sends an interrupt if the execution future is dropped before it concluded,
/// so cancelling the outer tool call propagates to the kernel.
struct InterruptOnDrop {
    channel: std::sync::Arc<dyn KernelChannel>,
    armed: bool,
}

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let channel = self.channel.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = channel.interrupt().await {
                        warn!("[engine] interrupt after cancellation failed: {e}");
                    }
                });
            }
        }
    }
}

pub struct ExecutionEngine {
    allow_images: bool,
    idle_wait: Duration,
}

impl ExecutionEngine {
    pub fn new(allow_images: bool, idle_wait: Duration) -> Self {
        Self {
            allow_images,
            idle_wait,
        }
    }

    /// Wait until the kernel is idle and this handle holds the single
    /// execution permit. Bounded by the idle-wait budget, which is deliberately
    /// shorter than the execution timeout.
    async fn wait_for_kernel_idle(
        &self,
        kernel: &KernelHandle,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, ToolError> {
        let permit = kernel
            .acquire_execution(self.idle_wait)
            .await
            .map_err(|e| ToolError::KernelUnavailable(e.to_string()))?;

        // The permit covers executions issued through this coordinator; the
        // busy flag also covers executions submitted by other clients.
        let started = Instant::now();
        while !kernel.channel.is_idle() {
            if started.elapsed() > self.idle_wait {
                return Err(ToolError::KernelUnavailable(format!(
                    "kernel {} still busy after {}s",
                    kernel.id,
                    self.idle_wait.as_secs()
                )));
            }
            info!(
                "[engine] Waiting for kernel to become idle... ({:.1}s)",
                started.elapsed().as_secs_f64()
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(permit)
    }

    /// Execute the cell at `index` in the resolved document.
    ///
    /// Index validation happens against the just-resolved document before the
    /// kernel task ever starts.
    pub async fn execute_cell(
        &self,
        doc: &DocumentTarget,
        index: i64,
        kernel: &KernelHandle,
        request: &ExecutionRequest,
    ) -> Result<Vec<OutputItem>, ToolError> {
        let cell_count = doc.cell_count().await?;
        if index < 0 || index as usize >= cell_count {
            return Err(ToolError::IndexOutOfRange { index, cell_count });
        }
        let index = index as usize;

        let cell = doc
            .cell(index)
            .await?
            .ok_or_else(|| ToolError::IndexOutOfRange {
                index: index as i64,
                cell_count,
            })?;
        if cell.cell_type != "code" {
            return Err(ToolError::InvalidCellType(cell.cell_type));
        }

        let _permit = self.wait_for_kernel_idle(kernel).await?;
        doc.apply(DocChange::ClearOutputs { index }).await?;

        let mut rx = kernel
            .channel
            .execute(&cell.source)
            .await
            .map_err(|e| ToolError::KernelUnavailable(e.to_string()))?;

        let mut guard = InterruptOnDrop {
            channel: kernel.channel.clone(),
            armed: true,
        };

        let timeout_secs = request.timeout.as_secs();
        let started = Instant::now();
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let mut poll = tokio::time::interval(Duration::from_secs(1));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        poll.reset();

        let polling = matches!(
            request.strategy,
            Strategy::ProgressStream | Strategy::ForcedSync
        );

        let mut streamed: Vec<OutputItem> = Vec::new();
        let mut seen_outputs = 0usize;
        let mut last_marker = Duration::ZERO;
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }

                event = rx.recv() => match event {
                    Some(KernelEvent::Started { execution_count }) => {
                        if let Some(count) = execution_count {
                            doc.apply(DocChange::SetExecutionCount { index, count }).await?;
                        }
                    }
                    Some(KernelEvent::Output(output)) => {
                        doc.apply(DocChange::AppendOutput { index, output }).await?;
                    }
                    Some(KernelEvent::Done(_)) | None => {
                        guard.disarm();
                        break;
                    }
                },

                _ = poll.tick(), if polling => {
                    let elapsed = started.elapsed();
                    match request.strategy {
                        Strategy::ProgressStream => {
                            let outputs = doc.outputs(index).await?;
                            if outputs.len() > seen_outputs {
                                for output in &outputs[seen_outputs..] {
                                    if let Some(item) = extract_output(output, self.allow_images) {
                                        streamed.push(OutputItem::text(format!(
                                            "[{:.1}s] {}",
                                            elapsed.as_secs_f64(),
                                            item.as_text().trim_end()
                                        )));
                                    }
                                }
                                seen_outputs = outputs.len();
                            }
                            let interval = Duration::from_secs(request.progress_interval.max(1));
                            if elapsed >= last_marker + interval {
                                last_marker = elapsed;
                                streamed.push(OutputItem::text(format!(
                                    "[PROGRESS: {:.1}s elapsed, {seen_outputs} outputs so far]",
                                    elapsed.as_secs_f64()
                                )));
                            }
                        }
                        Strategy::ForcedSync => {
                            if let Err(e) = doc.sync().await {
                                debug!("[engine] Sync attempt failed: {e}");
                            }
                        }
                        Strategy::BoundedWait => {}
                    }
                }
            }
        }

        if timed_out {
            // Cancel the observation first, then best-effort interrupt.
            drop(rx);
            guard.disarm();
            if request.strategy == Strategy::ProgressStream {
                streamed.push(OutputItem::text(format!(
                    "[TIMEOUT at {:.1}s: Cancelling execution]",
                    started.elapsed().as_secs_f64()
                )));
            }
            match kernel.channel.interrupt().await {
                Ok(()) => {
                    if request.strategy == Strategy::ProgressStream {
                        streamed.push(OutputItem::text("[Sent interrupt signal to kernel]"));
                    }
                }
                Err(e) => warn!("[engine] Failed to interrupt kernel: {e}"),
            }
        }

        let final_outputs = doc.outputs(index).await?;
        let mut result = safe_extract_outputs(&final_outputs, self.allow_images);

        if timed_out {
            return match request.strategy {
                Strategy::ForcedSync => Err(ToolError::ExecutionTimeout {
                    seconds: timeout_secs,
                    partial: result,
                }),
                Strategy::BoundedWait => {
                    result.push(OutputItem::text(format!(
                        "[TIMEOUT ERROR: Cell execution exceeded {timeout_secs} seconds]"
                    )));
                    Ok(result)
                }
                Strategy::ProgressStream => Ok(streamed),
            };
        }

        match request.strategy {
            Strategy::ProgressStream => {
                streamed.push(OutputItem::text(format!(
                    "[COMPLETED in {:.1}s]",
                    started.elapsed().as_secs_f64()
                )));
                // Outputs that landed between the last poll and completion.
                if final_outputs.len() > seen_outputs {
                    for output in &final_outputs[seen_outputs..] {
                        if let Some(item) = extract_output(output, self.allow_images) {
                            streamed.push(item);
                        }
                    }
                }
                if streamed.is_empty() {
                    streamed.push(OutputItem::text("[No output generated]"));
                }
                Ok(streamed)
            }
            Strategy::BoundedWait | Strategy::ForcedSync => Ok(result),
        }
    }

    /// Run inline code against a kernel, outside any document. Bounded-wait
    /// semantics: on timeout, outputs received so far plus a timeout marker.
    pub async fn execute_inline(
        &self,
        kernel: &KernelHandle,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<OutputItem>, ToolError> {
        let _permit = self.wait_for_kernel_idle(kernel).await?;

        let mut rx = kernel
            .channel
            .execute(code)
            .await
            .map_err(|e| ToolError::KernelUnavailable(e.to_string()))?;

        let mut guard = InterruptOnDrop {
            channel: kernel.channel.clone(),
            armed: true,
        };

        let timeout_secs = timeout.as_secs();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut collected = Vec::new();
        let mut timed_out = false;
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                event = rx.recv() => match event {
                    Some(KernelEvent::Output(output)) => collected.push(output),
                    Some(KernelEvent::Started { .. }) => {}
                    Some(KernelEvent::Done(_)) | None => {
                        guard.disarm();
                        break;
                    }
                },
            }
        }

        let mut result = safe_extract_outputs(&collected, self.allow_images);
        if timed_out {
            drop(rx);
            guard.disarm();
            if let Err(e) = kernel.channel.interrupt().await {
                warn!("[engine] Failed to interrupt kernel: {e}");
            }
            result.push(OutputItem::text(format!(
                "[TIMEOUT ERROR: Code execution exceeded {timeout_secs} seconds]"
            )));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local_content::LocalContentStore;
    use crate::backend::rooms::RoomRegistry;
    use crate::backend::testing::ScriptedKernelApi;
    use crate::backend::traits::{ContentStore, KernelApi};
    use crate::backend::Backend;
    use crate::doc::DocResolver;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    struct Fixture {
        backend: Backend,
        api: Arc<ScriptedKernelApi>,
        resolver: DocResolver,
        _tmp: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let api = Arc::new(ScriptedKernelApi::new());
        let backend = Backend {
            content: Arc::new(LocalContentStore::new(tmp.path())),
            kernels: api.clone(),
            collab: Arc::new(RoomRegistry::new()),
        };
        backend.content.create("nb.ipynb").await.unwrap();
        Fixture {
            backend,
            api,
            resolver: DocResolver::new(),
            _tmp: tmp,
        }
    }

    async fn doc_with_code(f: &Fixture, code: &str) -> DocumentTarget {
        let doc = f.resolver.resolve(&f.backend, "nb.ipynb").await.unwrap();
        doc.apply(DocChange::InsertCell {
            index: 0,
            cell_type: "code".into(),
            source: code.into(),
        })
        .await
        .unwrap();
        doc
    }

    async fn kernel(f: &Fixture) -> KernelHandle {
        let id = f.api.start().await.unwrap();
        f.api.get(&id).await.unwrap()
    }

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(true, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn fast_execution_returns_real_outputs() {
        let f = fixture().await;
        let doc = doc_with_code(&f, "1+1").await;
        let kernel = kernel(&f).await;

        let request = ExecutionRequest::new(Duration::from_secs(30), Strategy::BoundedWait);
        let outputs = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap();
        assert_eq!(outputs, vec![OutputItem::text("1+1")]);

        // Execution count landed in the document.
        let cell = doc.cell(0).await.unwrap().unwrap();
        assert_eq!(cell.execution_count, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_times_out_with_marker_and_interrupt() {
        let f = fixture().await;
        let doc = doc_with_code(&f, "sleep 120").await;
        let kernel = kernel(&f).await;

        let request = ExecutionRequest::new(Duration::from_secs(2), Strategy::BoundedWait);
        let start = Instant::now();
        let outputs = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap();
        // Returns within the timeout plus a bounded grace, not after 120s.
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(
            outputs.last().unwrap(),
            &OutputItem::text("[TIMEOUT ERROR: Cell execution exceeded 2 seconds]")
        );
        let channel = f.api.channel(&kernel.id).unwrap();
        assert_eq!(channel.interrupts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_never_starts_the_kernel() {
        let f = fixture().await;
        let doc = doc_with_code(&f, "1+1").await;
        let kernel = kernel(&f).await;

        let request = ExecutionRequest::new(Duration::from_secs(5), Strategy::BoundedWait);
        let err = engine()
            .execute_cell(&doc, 3, &kernel, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::IndexOutOfRange { index: 3, cell_count: 1 }));

        let err = engine()
            .execute_cell(&doc, -1, &kernel, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::IndexOutOfRange { index: -1, .. }));

        // No execution reached the channel: count stays unset.
        assert_eq!(doc.cell(0).await.unwrap().unwrap().execution_count, None);
    }

    #[tokio::test(start_paused = true)]
    async fn markdown_cells_are_rejected() {
        let f = fixture().await;
        let doc = f.resolver.resolve(&f.backend, "nb.ipynb").await.unwrap();
        doc.apply(DocChange::InsertCell {
            index: 0,
            cell_type: "markdown".into(),
            source: "# Title".into(),
        })
        .await
        .unwrap();
        let kernel = kernel(&f).await;

        let request = ExecutionRequest::new(Duration::from_secs(5), Strategy::BoundedWait);
        let err = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidCellType(t) if t == "markdown"));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_logs_progress_and_completion() {
        let f = fixture().await;
        // 4 chunks, one every 1.5s.
        let doc = doc_with_code(&f, "emit 4 1500").await;
        let kernel = kernel(&f).await;

        let mut request = ExecutionRequest::new(Duration::from_secs(60), Strategy::ProgressStream);
        request.progress_interval = 2;
        let outputs = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap();

        let text: Vec<&str> = outputs.iter().map(|o| o.as_text()).collect();
        assert!(text.iter().any(|t| t.contains("chunk 0")));
        assert!(text.iter().any(|t| t.starts_with("[PROGRESS:")));
        assert!(text.iter().any(|t| t.starts_with("[COMPLETED in")));
    }

    #[tokio::test(start_paused = true)]
    async fn forced_sync_times_out_with_typed_error() {
        let f = fixture().await;
        let doc = doc_with_code(&f, "sleep 120").await;
        let kernel = kernel(&f).await;

        let request = ExecutionRequest::new(Duration::from_secs(3), Strategy::ForcedSync);
        let err = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionTimeout { seconds: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn second_execution_waits_for_the_permit() {
        let f = fixture().await;
        let doc = doc_with_code(&f, "sleep 30").await;
        let kernel = kernel(&f).await;

        // Hold the permit as an in-flight execution would.
        let held = kernel.acquire_execution(Duration::from_secs(1)).await.unwrap();

        let request = ExecutionRequest::new(Duration::from_secs(60), Strategy::BoundedWait);
        let err = engine()
            .execute_cell(&doc, 0, &kernel, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::KernelUnavailable(_)));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn inline_code_times_out_with_marker() {
        let f = fixture().await;
        let kernel = kernel(&f).await;

        let outputs = engine()
            .execute_inline(&kernel, "sleep 120", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            outputs.last().unwrap(),
            &OutputItem::text("[TIMEOUT ERROR: Code execution exceeded 2 seconds]")
        );

        let outputs = engine()
            .execute_inline(&kernel, "2*3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outputs, vec![OutputItem::text("2*3")]);
    }
}
