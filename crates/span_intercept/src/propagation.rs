//! Capabilities supplied by the embedding application: how trace contexts
//! travel in call headers, and whether a new trace is sampled.

use span_relay::TraceContext;
use std::collections::HashMap;

/// Header carrier attached to a call.
pub type HeaderMap = HashMap<String, String>;

/// Reads and writes trace contexts on header carriers.
pub trait Propagation: Send + Sync {
    /// Returns the context carried by `carrier`, if any.
    fn extract(&self, carrier: &HeaderMap) -> Option<TraceContext>;

    /// Writes `context` onto `carrier`.
    fn inject(&self, context: &TraceContext, carrier: &mut HeaderMap);
}

/// Propagation that never finds a context and writes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPropagation;

impl Propagation for NoPropagation {
    fn extract(&self, _carrier: &HeaderMap) -> Option<TraceContext> {
        None
    }

    fn inject(&self, _context: &TraceContext, _carrier: &mut HeaderMap) {}
}

/// Sampling decision for a new trace.
pub trait Sampler: Send + Sync {
    fn sample(&self, trace_id: u128) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSample;

impl Sampler for AlwaysSample {
    fn sample(&self, _trace_id: u128) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSample;

impl Sampler for NeverSample {
    fn sample(&self, _trace_id: u128) -> bool {
        false
    }
}

impl<F> Sampler for F
where
    F: Fn(u128) -> bool + Send + Sync,
{
    fn sample(&self, trace_id: u128) -> bool {
        self(trace_id)
    }
}
