use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the reporting pipeline.
///
/// The producer-side counters (`spans_reported`, `spans_dropped`) are bumped by
/// arbitrary application threads and sit on their own cache lines so they do
/// not contend with the counters the flush task updates.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    spans_reported: CachePadded<AtomicU64>,
    spans_dropped: CachePadded<AtomicU64>,
    bytes_dropped: AtomicU64,
    spans_sent: AtomicU64,
    batches_sent: AtomicU64,
    send_errors: AtomicU64,
    spans_lost_on_send: AtomicU64,
    refreshes: AtomicU64,
    transport_build_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub spans_reported: u64,
    pub spans_dropped: u64,
    pub bytes_dropped: u64,
    pub spans_sent: u64,
    pub batches_sent: u64,
    pub send_errors: u64,
    pub spans_lost_on_send: u64,
    pub refreshes: u64,
    pub transport_build_failures: u64,
}

// All methods use `Ordering::Relaxed`: these are statistical counters that
// guard no other data, and slightly stale reads are fine for observability.
impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spans accepted into the buffer
    pub fn spans_reported(&self) -> u64 {
        self.spans_reported.load(Ordering::Relaxed)
    }

    /// Spans rejected because a buffer bound was hit
    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    /// Encoded bytes of the rejected spans
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    /// Spans handed to a transport that reported success
    pub fn spans_sent(&self) -> u64 {
        self.spans_sent.load(Ordering::Relaxed)
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    /// Batches a transport failed to send
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Spans discarded together with a failed batch
    pub fn spans_lost_on_send(&self) -> u64 {
        self.spans_lost_on_send.load(Ordering::Relaxed)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn transport_build_failures(&self) -> u64 {
        self.transport_build_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spans_reported: self.spans_reported(),
            spans_dropped: self.spans_dropped(),
            bytes_dropped: self.bytes_dropped(),
            spans_sent: self.spans_sent(),
            batches_sent: self.batches_sent(),
            send_errors: self.send_errors(),
            spans_lost_on_send: self.spans_lost_on_send(),
            refreshes: self.refreshes(),
            transport_build_failures: self.transport_build_failures(),
        }
    }

    pub(crate) fn record_accepted(&self) {
        self.spans_reported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, bytes: usize) {
        self.spans_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, span_count: u64) {
        self.spans_sent.fetch_add(span_count, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self, span_count: u64) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        self.spans_lost_on_send.fetch_add(span_count, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_build_failure(&self) {
        self.transport_build_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_dropped(120);
        metrics.record_sent(2);
        metrics.record_send_error(5);
        metrics.record_refresh();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spans_reported, 2);
        assert_eq!(snapshot.spans_dropped, 1);
        assert_eq!(snapshot.bytes_dropped, 120);
        assert_eq!(snapshot.spans_sent, 2);
        assert_eq!(snapshot.batches_sent, 1);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.spans_lost_on_send, 5);
        assert_eq!(snapshot.refreshes, 1);
        assert_eq!(snapshot.transport_build_failures, 0);
    }
}
