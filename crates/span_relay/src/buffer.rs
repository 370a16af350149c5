//! Bounded span buffer.
//!
//! Many application threads enqueue finished spans; one flush task drains
//! them. The buffer is bounded both by span count and by cumulative encoded
//! size. A span that does not fit is rejected on the spot: `enqueue` never
//! waits for room.
//!
//! The buffer has its own lock, independent of the pipeline's transport lock,
//! so `report()` is never serialized behind a `refresh()`.

use crate::config::TransportConfig;
use crate::invariants::{debug_assert_batch_bounded, debug_assert_bytes_tracked, debug_assert_within_bounds};
use crate::metrics::PipelineMetrics;
use crate::span::Span;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Computes the encoded size of a span, used for byte accounting.
pub trait SpanSizer: Send + Sync {
    fn size_of(&self, span: &Span) -> usize;
}

/// Exact size of the span's JSON encoding, counted without buffering the output.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSizer;

impl SpanSizer for JsonSizer {
    fn size_of(&self, span: &Span) -> usize {
        let mut counter = ByteCounter(0);
        // Writing into a counter cannot fail; the count is exact either way.
        let _ = serde_json::to_writer(&mut counter, span);
        counter.0
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Limits applied to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Maximum number of spans waiting
    pub queued_max_spans: usize,
    /// Maximum encoded size of all spans waiting
    pub queued_max_bytes: usize,
    /// Span count at which a full batch is ready
    pub max_batch_spans: usize,
    /// Encoded size at which a full batch is ready; larger spans are rejected
    pub max_batch_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for BufferLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            queued_max_spans: config.queued_max_spans,
            queued_max_bytes: config.queued_max_bytes,
            max_batch_spans: config.max_batch_spans,
            max_batch_bytes: config.max_batch_bytes,
        }
    }
}

struct Pending {
    span: Span,
    size: usize,
}

struct State {
    queue: VecDeque<Pending>,
    bytes: usize,
    limits: BufferLimits,
}

impl State {
    fn has_full_batch(&self) -> bool {
        self.queue.len() >= self.limits.max_batch_spans || self.bytes >= self.limits.max_batch_bytes
    }
}

/// FIFO of finished spans bounded by count and encoded size.
///
/// The queue bounds are enforced at admission: `enqueue` never lets the
/// queue grow past them. Tightening them through [`set_limits`] does not
/// evict anything, so the queue may sit above the new bounds until the
/// scheduler drains it, and refuses new spans until then.
///
/// [`set_limits`]: BoundedBuffer::set_limits
pub struct BoundedBuffer {
    state: Mutex<State>,
    sizer: Box<dyn SpanSizer>,
    pressure: Notify,
    metrics: Arc<PipelineMetrics>,
}

impl BoundedBuffer {
    /// Creates a buffer using exact JSON sizing.
    pub fn new(limits: BufferLimits, metrics: Arc<PipelineMetrics>) -> Self {
        Self::with_sizer(limits, Box::new(JsonSizer), metrics)
    }

    pub fn with_sizer(limits: BufferLimits, sizer: Box<dyn SpanSizer>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                bytes: 0,
                limits,
            }),
            sizer,
            pressure: Notify::new(),
            metrics,
        }
    }

    // The critical sections never panic midway, so a poisoned lock still
    // guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a span at the tail.
    ///
    /// Returns `false` (and counts the span as dropped) when admitting it would
    /// exceed a queue bound, or when the span alone is larger than a batch may be.
    /// Wakes the flush task once a full batch is waiting.
    pub fn enqueue(&self, span: Span) -> bool {
        // Sizing happens outside the lock.
        let size = self.sizer.size_of(&span);

        let mut state = self.lock();
        let limits = state.limits;
        if size > limits.max_batch_bytes
            || state.queue.len() >= limits.queued_max_spans
            || state.bytes.saturating_add(size) > limits.queued_max_bytes
        {
            drop(state);
            self.metrics.record_dropped(size);
            return false;
        }

        state.queue.push_back(Pending { span, size });
        state.bytes += size;

        debug_assert_within_bounds!(state.queue.len(), state.bytes, limits);

        let ready = state.has_full_batch();
        drop(state);

        self.metrics.record_accepted();
        if ready {
            // Stores a permit if the flush task is not waiting right now.
            self.pressure.notify_one();
        }
        true
    }

    /// Removes up to `max_spans` spans from the head, oldest first, stopping
    /// before their cumulative size would exceed `max_bytes`.
    ///
    /// A head span larger than `max_bytes` on its own is still returned (alone),
    /// so a tightened byte limit can never wedge the queue.
    pub fn drain(&self, max_spans: usize, max_bytes: usize) -> Vec<Span> {
        let mut state = self.lock();
        let mut spans = Vec::with_capacity(max_spans.min(state.queue.len()));
        let mut batch_bytes = 0usize;

        while spans.len() < max_spans {
            let fits = match state.queue.front() {
                Some(head) => spans.is_empty() || batch_bytes + head.size <= max_bytes,
                None => false,
            };
            if !fits {
                break;
            }
            let Some(Pending { span, size }) = state.queue.pop_front() else {
                break;
            };

            debug_assert_bytes_tracked!(state.bytes, size);

            state.bytes -= size;
            batch_bytes += size;
            spans.push(span);
        }

        debug_assert_batch_bounded!(spans.len(), batch_bytes, max_spans, max_bytes);

        spans
    }

    /// Drains one batch using the configured batch limits.
    pub fn drain_batch(&self) -> Vec<Span> {
        let limits = self.limits();
        self.drain(limits.max_batch_spans, limits.max_batch_bytes)
    }

    /// Returns true when at least one full batch is waiting.
    pub fn has_full_batch(&self) -> bool {
        self.lock().has_full_batch()
    }

    /// Replaces the limits. Spans already queued are kept even if the new
    /// bounds are tighter; admissions are refused until the queue fits again.
    pub fn set_limits(&self, limits: BufferLimits) {
        let ready = {
            let mut state = self.lock();
            state.limits = limits;
            state.has_full_batch()
        };
        if ready {
            self.pressure.notify_one();
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.lock().limits
    }

    /// Number of spans waiting
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Encoded size of all spans waiting
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Signal raised when a full batch becomes available.
    pub(crate) fn pressure(&self) -> &Notify {
        &self.pressure
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{ActiveSpan, TraceContext};
    use std::thread;

    /// Every span weighs the same.
    struct FixedSizer(usize);

    impl SpanSizer for FixedSizer {
        fn size_of(&self, _span: &Span) -> usize {
            self.0
        }
    }

    fn span(name: &str) -> Span {
        ActiveSpan::start(TraceContext::new_root(true), name).finish()
    }

    fn limits(queued_spans: usize, queued_bytes: usize, batch_spans: usize, batch_bytes: usize) -> BufferLimits {
        BufferLimits {
            queued_max_spans: queued_spans,
            queued_max_bytes: queued_bytes,
            max_batch_spans: batch_spans,
            max_batch_bytes: batch_bytes,
        }
    }

    fn fixed_buffer(limits: BufferLimits, size: usize) -> BoundedBuffer {
        BoundedBuffer::with_sizer(limits, Box::new(FixedSizer(size)), Arc::new(PipelineMetrics::new()))
    }

    #[test]
    fn test_drain_is_fifo() {
        let buffer = fixed_buffer(limits(10, 1000, 10, 1000), 10);
        for i in 0..5 {
            assert!(buffer.enqueue(span(&format!("op-{}", i))));
        }

        let names: Vec<String> = buffer.drain(3, 1000).iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["op-0", "op-1", "op-2"]);

        let names: Vec<String> = buffer.drain(10, 1000).iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["op-3", "op-4"]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_count_bound_rejects_excess() {
        let buffer = fixed_buffer(limits(3, 1000, 10, 1000), 10);
        let accepted: Vec<bool> = (0..5).map(|i| buffer.enqueue(span(&format!("op-{}", i)))).collect();

        assert_eq!(accepted, [true, true, true, false, false]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.metrics().spans_dropped(), 2);
        assert_eq!(buffer.metrics().bytes_dropped(), 20);
        assert_eq!(buffer.metrics().spans_reported(), 3);
    }

    #[test]
    fn test_byte_bound_rejects_excess() {
        let buffer = fixed_buffer(limits(100, 25, 10, 1000), 10);
        assert!(buffer.enqueue(span("a")));
        assert!(buffer.enqueue(span("b")));
        assert!(!buffer.enqueue(span("c")));
        assert_eq!(buffer.bytes(), 20);
    }

    #[test]
    fn test_span_larger_than_batch_is_rejected() {
        let buffer = fixed_buffer(limits(100, 10_000, 10, 50), 60);
        assert!(!buffer.enqueue(span("huge")));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_respects_byte_limit() {
        let buffer = fixed_buffer(limits(100, 10_000, 100, 10_000), 40);
        for i in 0..5 {
            buffer.enqueue(span(&format!("op-{}", i)));
        }

        assert_eq!(buffer.drain(100, 100).len(), 2);
        // A head span bigger than the limit still goes out on its own.
        assert_eq!(buffer.drain(100, 10).len(), 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_full_batch_detection() {
        let buffer = fixed_buffer(limits(100, 10_000, 2, 10_000), 10);
        buffer.enqueue(span("a"));
        assert!(!buffer.has_full_batch());
        buffer.enqueue(span("b"));
        assert!(buffer.has_full_batch());
        buffer.drain_batch();
        assert!(!buffer.has_full_batch());
    }

    #[test]
    fn test_tightened_limits_keep_queued_spans() {
        let buffer = fixed_buffer(limits(10, 1000, 10, 1000), 10);
        for i in 0..5 {
            buffer.enqueue(span(&format!("op-{}", i)));
        }

        buffer.set_limits(limits(2, 1000, 10, 1000));
        assert_eq!(buffer.len(), 5);
        assert!(!buffer.enqueue(span("late")));
        assert_eq!(buffer.drain(10, 1000).len(), 5);
        assert!(buffer.enqueue(span("fits-again")));
    }

    #[test]
    fn test_json_sizer_matches_encoding() {
        let span = span("sized");
        let encoded = serde_json::to_vec(&span).unwrap();
        assert_eq!(JsonSizer.size_of(&span), encoded.len());
    }

    #[test]
    fn test_concurrent_enqueue_never_exceeds_bound() {
        let buffer = Arc::new(fixed_buffer(limits(1000, usize::MAX, 1000, 1000), 1));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    (0..500)
                        .filter(|i| buffer.enqueue(span(&format!("t{}-{}", t, i))))
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 1000);
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.metrics().spans_dropped(), 3000);
    }
}
