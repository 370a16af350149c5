//! Refreshable span reporting pipeline
//!
//! Instrumented code hands finished spans to a [`RefreshablePipeline`], which
//! queues them in a bounded buffer and ships them in batches from a background
//! flush task. The transport behind the pipeline can be replaced at runtime
//! with [`RefreshablePipeline::refresh`] without losing queued spans.
//!
//! # Example
//!
//! ```ignore
//! use span_relay::{ActiveSpan, DefaultTransportFactory, Endpoint, RefreshablePipeline, TraceContext, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = RefreshablePipeline::new(DefaultTransportFactory);
//!     pipeline.refresh(TransportConfig::enabled(Endpoint::Stdout { verbose: false })).await;
//!
//!     let mut span = ActiveSpan::start(TraceContext::new_root(true), "checkout");
//!     span.tag("order.id", "42");
//!     pipeline.report(span.finish());
//!
//!     pipeline.shutdown().await;
//! }
//! ```

mod invariants;
mod scheduler;

pub mod buffer;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod span;
pub mod transport;

pub use buffer::{BoundedBuffer, BufferLimits, JsonSizer, SpanSizer};
pub use config::{ConfigError, Endpoint, TransportConfig, DEFAULT_FLUSH_TIMEOUT};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{RefreshablePipeline, Reporter};
pub use span::{ActiveSpan, Span, SpanBatch, SpanKind, TraceContext, ERROR_TAG};
pub use transport::{
    DefaultTransportFactory, JsonFileTransport, NoopTransport, StdoutTransport, TcpTransport, Transport,
    TransportBoxed, TransportError, TransportFactory, TransportFuture,
};
