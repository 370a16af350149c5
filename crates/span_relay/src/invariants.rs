//! Debug assertion macros for buffer and pipeline invariants.
//!
//! Only active in debug builds, so there is no overhead in release builds.

// =============================================================================
// Buffer bounds
// =============================================================================

/// Assert that an admission left the buffer within its configured bounds.
///
/// **Invariant**: `len ≤ queued_max_spans ∧ bytes ≤ queued_max_bytes` after every accepted span
///
/// Used in: `BoundedBuffer::enqueue()`
macro_rules! debug_assert_within_bounds {
    ($len:expr, $bytes:expr, $limits:expr) => {
        debug_assert!(
            $len <= $limits.queued_max_spans && $bytes <= $limits.queued_max_bytes,
            "buffer bound violated: {} spans / {} bytes exceeds {} spans / {} bytes",
            $len,
            $bytes,
            $limits.queued_max_spans,
            $limits.queued_max_bytes
        )
    };
}

// =============================================================================
// Batch bounds
// =============================================================================

/// Assert that a drained batch respects the requested limits.
///
/// **Invariant**: `batch_len ≤ max_spans ∧ (batch_bytes ≤ max_bytes ∨ batch_len == 1)`
///
/// A single oversized span is allowed through so the queue always makes progress.
///
/// Used in: `BoundedBuffer::drain()`
macro_rules! debug_assert_batch_bounded {
    ($count:expr, $bytes:expr, $max_spans:expr, $max_bytes:expr) => {
        debug_assert!(
            $count <= $max_spans && ($bytes <= $max_bytes || $count == 1),
            "batch bound violated: {} spans / {} bytes exceeds {} spans / {} bytes",
            $count,
            $bytes,
            $max_spans,
            $max_bytes
        )
    };
}

// =============================================================================
// Byte accounting
// =============================================================================

/// Assert that the tracked byte total never underflows on removal.
///
/// Used in: `BoundedBuffer::drain()`
macro_rules! debug_assert_bytes_tracked {
    ($tracked:expr, $removed:expr) => {
        debug_assert!(
            $tracked >= $removed,
            "byte accounting underflow: removing {} bytes from {} tracked",
            $removed,
            $tracked
        )
    };
}

// =============================================================================
// Scheduler exclusivity
// =============================================================================

/// Assert that no flush task is still attached when a new one is started.
///
/// **Invariant**: at most one flush task per pipeline sends at any time
///
/// Used in: `RefreshablePipeline::refresh()`
macro_rules! debug_assert_no_scheduler {
    ($scheduler:expr) => {
        debug_assert!(
            $scheduler.is_none(),
            "a flush scheduler is still installed while starting a new one"
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_bytes_tracked;
pub(crate) use debug_assert_no_scheduler;
pub(crate) use debug_assert_within_bounds;
