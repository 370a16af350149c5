//! Flush scheduler.
//!
//! One tokio task per installed transport. It wakes when the flush timeout
//! elapses since the last flush (also under zero traffic), or when the buffer
//! signals that a full batch is waiting, and hands drained batches to the
//! transport it was started with. Send failures are logged and the batch is
//! dropped; there is no retry queue.
//!
//! Stopping the scheduler never drains the buffer: spans accepted while a
//! transport is being swapped stay queued for the next scheduler.

use crate::buffer::BoundedBuffer;
use crate::config::TransportConfig;
use crate::metrics::PipelineMetrics;
use crate::span::SpanBatch;
use crate::transport::TransportBoxed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Used when the flush timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Batch limits and timing used by one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushSettings {
    pub(crate) max_batch_spans: usize,
    pub(crate) max_batch_bytes: usize,
    pub(crate) flush_timeout: Duration,
}

impl From<&TransportConfig> for FlushSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_batch_spans: config.max_batch_spans,
            max_batch_bytes: config.max_batch_bytes,
            flush_timeout: config.flush_timeout,
        }
    }
}

/// Handle to a running flush task.
pub(crate) struct FlushScheduler {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FlushScheduler {
    /// Spawns the flush task. Must be called from within a tokio runtime.
    pub(crate) fn start(
        buffer: Arc<BoundedBuffer>,
        transport: Arc<dyn TransportBoxed>,
        settings: FlushSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut deadline = next_deadline(settings.flush_timeout);

            loop {
                tokio::select! {
                    biased;

                    // Stop requested, or the handle was dropped with the pipeline.
                    _ = &mut shutdown_rx => break,

                    () = buffer.pressure().notified() => {
                        let mut flushed = false;
                        while buffer.has_full_batch() {
                            if stop_requested(&mut shutdown_rx) {
                                return;
                            }
                            flushed |= ship(&buffer, transport.as_ref(), settings, &metrics).await > 0;
                        }
                        if flushed {
                            deadline = next_deadline(settings.flush_timeout);
                        }
                    }

                    () = sleep_until(deadline) => {
                        // Bounded by what was queued at wake-up so a busy
                        // producer cannot keep this loop from checking for stop.
                        let mut budget = buffer.len();
                        while budget > 0 {
                            if stop_requested(&mut shutdown_rx) {
                                return;
                            }
                            let sent = ship(&buffer, transport.as_ref(), settings, &metrics).await;
                            if sent == 0 {
                                break;
                            }
                            budget = budget.saturating_sub(sent);
                        }
                        deadline = next_deadline(settings.flush_timeout);
                    }
                }
            }

            debug!(transport = transport.name(), "flush scheduler stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Asks the task to stop before its next batch. Does not wait.
    pub(crate) fn signal_stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Waits for the task to exit. A send already in flight completes (or
    /// fails) first.
    pub(crate) async fn join(mut self) {
        self.signal_stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "flush scheduler task failed");
        }
    }
}

/// Deadline `timeout` from now, saturating at a far-future instant.
fn next_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn stop_requested(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}

/// Drains one batch and sends it. Returns the number of spans drained,
/// whether or not the send succeeded; zero means the buffer was empty.
pub(crate) async fn ship(
    buffer: &BoundedBuffer,
    transport: &dyn TransportBoxed,
    settings: FlushSettings,
    metrics: &PipelineMetrics,
) -> usize {
    let spans = buffer.drain(settings.max_batch_spans, settings.max_batch_bytes);
    if spans.is_empty() {
        return 0;
    }

    let count = spans.len();
    match transport.send_boxed(SpanBatch::with_spans(spans)).await {
        Ok(()) => metrics.record_sent(count as u64),
        Err(e) => {
            metrics.record_send_error(count as u64);
            warn!(
                transport = transport.name(),
                spans = count,
                error = %e,
                "dropping batch after send failure"
            );
        }
    }
    count
}
