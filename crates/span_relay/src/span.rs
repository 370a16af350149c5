//! Span and trace-context model.
//!
//! A span moves through two types: [`ActiveSpan`] while the traced operation
//! runs, and [`Span`] once it has been finished. `ActiveSpan::finish` consumes
//! the active span, so a span can be finished at most once and only finished
//! spans can be handed to a reporter.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Tag key under which the error message of a failed span is encoded.
pub const ERROR_TAG: &str = "error";

/// Causal position of a span: which trace it belongs to and who its parent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: u128,
    span_id: u64,
    parent_span_id: Option<u64>,
    sampled: bool,
}

impl TraceContext {
    /// Builds a context from known identifiers, e.g. one extracted from headers.
    pub const fn new(trace_id: u128, span_id: u64, parent_span_id: Option<u64>, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            sampled,
        }
    }

    /// Starts a new trace with random, non-zero identifiers.
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: next_trace_id(),
            span_id: next_span_id(),
            parent_span_id: None,
            sampled,
        }
    }

    /// Derives the context of a child span: same trace, same sampling decision,
    /// this span as parent, fresh span id.
    pub fn child(&self) -> Self {
        let mut span_id = next_span_id();
        while span_id == self.span_id {
            span_id = next_span_id();
        }
        Self {
            trace_id: self.trace_id,
            span_id,
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
        }
    }

    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<u64> {
        self.parent_span_id
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

fn next_span_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

fn next_trace_id() -> u128 {
    loop {
        let id = rand::random::<u128>();
        if id != 0 {
            return id;
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Span kind, following the Zipkin/OpenTelemetry vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// A span whose operation is still running.
///
/// Created before the traced call executes; tags and the error can be set
/// while the call runs. [`ActiveSpan::finish`] turns it into a reportable [`Span`].
#[derive(Debug)]
pub struct ActiveSpan {
    context: TraceContext,
    name: String,
    kind: SpanKind,
    remote_service_name: Option<String>,
    timestamp_micros: u64,
    started: Instant,
    tags: BTreeMap<String, String>,
    error: Option<String>,
    finished: bool,
}

impl ActiveSpan {
    /// Starts a span now under the given context.
    pub fn start(context: TraceContext, name: impl Into<String>) -> Self {
        Self {
            context,
            name: name.into(),
            kind: SpanKind::Internal,
            remote_service_name: None,
            timestamp_micros: now_micros(),
            started: Instant::now(),
            tags: BTreeMap::new(),
            error: None,
            finished: false,
        }
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_kind(&mut self, kind: SpanKind) {
        self.kind = kind;
    }

    pub fn set_remote_service_name(&mut self, name: impl Into<String>) {
        self.remote_service_name = Some(name.into());
    }

    /// Adds or replaces a tag.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Records the failure of the traced operation. The last error wins.
    pub fn error(&mut self, message: impl Into<String>) -> &mut Self {
        self.error = Some(message.into());
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Marks the span as finished, recording its duration.
    ///
    /// The duration comes from a monotonic clock and is never reported as zero.
    pub fn finish(mut self) -> Span {
        let duration_micros = (self.started.elapsed().as_micros() as u64).max(1);
        self.finished = true;
        Span {
            context: self.context,
            name: std::mem::take(&mut self.name),
            kind: self.kind,
            remote_service_name: self.remote_service_name.take(),
            timestamp_micros: self.timestamp_micros,
            duration_micros,
            tags: std::mem::take(&mut self.tags),
            error: self.error.take(),
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                trace_id = %format_args!("{:032x}", self.context.trace_id),
                span_id = %format_args!("{:016x}", self.context.span_id),
                name = %self.name,
                "span dropped without being finished"
            );
        }
    }
}

/// A finished span, ready for batching. Timing fields are fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    context: TraceContext,
    name: String,
    kind: SpanKind,
    remote_service_name: Option<String>,
    timestamp_micros: u64,
    duration_micros: u64,
    tags: BTreeMap<String, String>,
    error: Option<String>,
}

impl Span {
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn trace_id(&self) -> u128 {
        self.context.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.context.span_id
    }

    pub fn parent_span_id(&self) -> Option<u64> {
        self.context.parent_span_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_service_name.as_deref()
    }

    /// Start time, microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp_micros
    }

    /// End time, microseconds since the Unix epoch.
    pub fn end_micros(&self) -> u64 {
        self.timestamp_micros.saturating_add(self.duration_micros)
    }

    pub fn duration_micros(&self) -> u64 {
        self.duration_micros
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// Encoded in the Zipkin v2 JSON shape: hex identifiers, microsecond timing,
// and the error message carried as the `error` tag.
impl Serialize for Span {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("traceId", &format!("{:032x}", self.context.trace_id))?;
        map.serialize_entry("id", &format!("{:016x}", self.context.span_id))?;
        if let Some(parent) = self.context.parent_span_id {
            map.serialize_entry("parentId", &format!("{:016x}", parent))?;
        }
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("kind", &self.kind)?;
        map.serialize_entry("timestamp", &self.timestamp_micros)?;
        map.serialize_entry("duration", &self.duration_micros)?;
        if let Some(service) = &self.remote_service_name {
            map.serialize_entry("remoteEndpoint", &RemoteEndpoint { service_name: service })?;
        }
        if !self.tags.is_empty() || self.error.is_some() {
            let mut tags: BTreeMap<&str, &str> = self
                .tags
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            if let Some(error) = &self.error {
                tags.insert(ERROR_TAG, error);
            }
            map.serialize_entry("tags", &tags)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteEndpoint<'a> {
    service_name: &'a str,
}

/// Batch of finished spans handed to a transport
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch, oldest first
    pub spans: Vec<Span>,
}

impl SpanBatch {
    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Encodes the batch as a single JSON array.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.spans)
    }
}
