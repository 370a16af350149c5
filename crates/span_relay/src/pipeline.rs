//! Refreshable reporting pipeline.
//!
//! [`RefreshablePipeline`] owns the span buffer, the flush scheduler and the
//! currently installed transport. `report()` only touches the buffer.
//! `refresh()` swaps the transport under the pipeline lock:
//!
//! ```text
//!   refresh(config)
//!     ├─ signal old scheduler to stop
//!     ├─ close old transport (errors swallowed)
//!     ├─ wait for old scheduler to exit
//!     ├─ build new transport (or NoopTransport if disabled / build fails)
//!     ├─ install transport, apply buffer limits
//!     └─ start new scheduler against the installed transport
//! ```
//!
//! The buffer keeps accepting spans throughout; nothing already queued is
//! dropped by a swap.

use crate::buffer::{BoundedBuffer, BufferLimits, SpanSizer};
use crate::config::TransportConfig;
use crate::invariants::debug_assert_no_scheduler;
use crate::metrics::PipelineMetrics;
use crate::scheduler::{ship, FlushScheduler, FlushSettings};
use crate::span::Span;
use crate::transport::{NoopTransport, TransportBoxed, TransportFactory};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Receives finished spans.
///
/// Implementations must not block: reporters are called from the
/// instrumented call path.
pub trait Reporter: Send + Sync {
    fn report(&self, span: Span);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn report(&self, span: Span) {
        (**self).report(span);
    }
}

/// What the pipeline lock guards.
struct Installed {
    transport: Option<Arc<dyn TransportBoxed>>,
    scheduler: Option<FlushScheduler>,
    settings: FlushSettings,
    enabled: bool,
}

/// Span pipeline whose transport can be replaced at runtime.
pub struct RefreshablePipeline {
    buffer: Arc<BoundedBuffer>,
    factory: Box<dyn TransportFactory>,
    installed: Mutex<Installed>,
    metrics: Arc<PipelineMetrics>,
}

impl RefreshablePipeline {
    /// Creates a pipeline with default buffer limits and no transport.
    ///
    /// Until the first [`refresh`](Self::refresh) the pipeline is disabled:
    /// spans are queued (up to the buffer bounds) but nothing flushes them.
    pub fn new(factory: impl TransportFactory + 'static) -> Self {
        Self::with_limits(factory, BufferLimits::default())
    }

    pub fn with_limits(factory: impl TransportFactory + 'static, limits: BufferLimits) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = BoundedBuffer::new(limits, Arc::clone(&metrics));
        Self::from_parts(factory, buffer, metrics)
    }

    /// Creates a pipeline whose byte accounting uses a custom sizer.
    pub fn with_sizer(
        factory: impl TransportFactory + 'static,
        limits: BufferLimits,
        sizer: Box<dyn SpanSizer>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = BoundedBuffer::with_sizer(limits, sizer, Arc::clone(&metrics));
        Self::from_parts(factory, buffer, metrics)
    }

    fn from_parts(factory: impl TransportFactory + 'static, buffer: BoundedBuffer, metrics: Arc<PipelineMetrics>) -> Self {
        let limits = buffer.limits();
        Self {
            buffer: Arc::new(buffer),
            factory: Box::new(factory),
            installed: Mutex::new(Installed {
                transport: None,
                scheduler: None,
                settings: FlushSettings {
                    max_batch_spans: limits.max_batch_spans,
                    max_batch_bytes: limits.max_batch_bytes,
                    flush_timeout: TransportConfig::default().flush_timeout,
                },
                enabled: false,
            }),
            metrics,
        }
    }

    /// Queues a finished span. Never blocks and never fails; a span that does
    /// not fit is counted in [`PipelineMetrics::spans_dropped`].
    pub fn report(&self, span: Span) {
        if !self.buffer.enqueue(span) {
            debug!(pending = self.buffer.len(), "span dropped: buffer full");
        }
    }

    /// Replaces the transport and the batching parameters.
    ///
    /// Concurrent calls serialize; the last one wins. Close and construction
    /// failures are logged and leave a [`NoopTransport`] installed.
    pub async fn refresh(&self, config: TransportConfig) {
        let mut installed = self.installed.lock().await;
        self.metrics.record_refresh();

        let old_scheduler = installed.scheduler.take().map(|mut scheduler| {
            scheduler.signal_stop();
            scheduler
        });
        if let Some(old) = installed.transport.take() {
            if let Err(e) = old.close_boxed().await {
                debug!(transport = old.name(), error = %e, "ignoring error while closing transport");
            }
        }
        if let Some(scheduler) = old_scheduler {
            scheduler.join().await;
        }

        let (config, transport) = self.build_transport(config);

        self.buffer.set_limits(BufferLimits::from(&config));
        installed.settings = FlushSettings::from(&config);
        installed.enabled = config.enabled;
        installed.transport = Some(Arc::clone(&transport));

        debug_assert_no_scheduler!(installed.scheduler);

        installed.scheduler = Some(FlushScheduler::start(
            Arc::clone(&self.buffer),
            Arc::clone(&transport),
            installed.settings,
            Arc::clone(&self.metrics),
        ));

        info!(
            transport = transport.name(),
            enabled = installed.enabled,
            max_batch_spans = installed.settings.max_batch_spans,
            flush_timeout_ms = installed.settings.flush_timeout.as_millis() as u64,
            "span transport refreshed"
        );
    }

    /// Picks the transport for a snapshot, falling back to a no-op one.
    fn build_transport(&self, config: TransportConfig) -> (TransportConfig, Arc<dyn TransportBoxed>) {
        if let Err(e) = config.validate() {
            warn!(error = %e, "invalid transport configuration, reporting disabled");
            self.metrics.record_build_failure();
            return (TransportConfig::disabled(), Arc::new(NoopTransport::new()));
        }
        if !config.enabled {
            return (config, Arc::new(NoopTransport::new()));
        }
        match self.factory.build(&config) {
            Ok(transport) => (config, transport),
            Err(e) => {
                warn!(endpoint = ?config.endpoint, error = %e, "could not build transport, reporting disabled");
                self.metrics.record_build_failure();
                let config = TransportConfig {
                    enabled: false,
                    ..config
                };
                (config, Arc::new(NoopTransport::new()))
            }
        }
    }

    /// Sends everything queued right now through the installed transport,
    /// in batches. Returns the number of spans handed to the transport.
    ///
    /// The flush task is stopped for the duration, after its in-flight batch
    /// has been sent, so batches still reach the transport in queue order.
    /// Does nothing (and keeps the spans) when no transport is installed.
    pub async fn flush(&self) -> usize {
        let mut installed = self.installed.lock().await;
        let Some(transport) = installed.transport.clone() else {
            return 0;
        };
        if let Some(scheduler) = installed.scheduler.take() {
            scheduler.join().await;
        }

        let flushed = self.flush_with(transport.as_ref(), installed.settings).await;

        debug_assert_no_scheduler!(installed.scheduler);
        installed.scheduler = Some(FlushScheduler::start(
            Arc::clone(&self.buffer),
            transport,
            installed.settings,
            Arc::clone(&self.metrics),
        ));
        flushed
    }

    async fn flush_with(&self, transport: &dyn TransportBoxed, settings: FlushSettings) -> usize {
        // Bounded by what is queued now; spans reported meanwhile wait for the scheduler.
        let mut budget = self.buffer.len();
        let mut handled = 0;
        while budget > 0 {
            let sent = ship(&self.buffer, transport, settings, &self.metrics).await;
            if sent == 0 {
                break;
            }
            handled += sent;
            budget = budget.saturating_sub(sent);
        }
        handled
    }

    /// Stops the scheduler, flushes what is queued and closes the transport.
    ///
    /// Idempotent. Spans reported afterwards are queued until the next refresh.
    pub async fn shutdown(&self) {
        let mut installed = self.installed.lock().await;
        if let Some(scheduler) = installed.scheduler.take() {
            scheduler.join().await;
        }
        if let Some(transport) = installed.transport.take() {
            let flushed = self.flush_with(transport.as_ref(), installed.settings).await;
            if let Err(e) = transport.close_boxed().await {
                debug!(transport = transport.name(), error = %e, "ignoring error while closing transport");
            }
            info!(transport = transport.name(), flushed, "span pipeline shut down");
        }
        installed.enabled = false;
    }

    /// Name of the installed transport, if any.
    pub async fn transport_name(&self) -> Option<String> {
        let installed = self.installed.lock().await;
        installed.transport.as_ref().map(|t| t.name().to_string())
    }

    /// True when the last refresh installed a real transport.
    pub async fn is_enabled(&self) -> bool {
        self.installed.lock().await.enabled
    }

    /// Number of spans waiting in the buffer
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &Arc<BoundedBuffer> {
        &self.buffer
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

impl Reporter for RefreshablePipeline {
    fn report(&self, span: Span) {
        RefreshablePipeline::report(self, span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::span::{ActiveSpan, TraceContext};
    use crate::transport::{RecordingTransport, TransportError};
    use std::time::Duration;

    fn span(name: &str) -> Span {
        ActiveSpan::start(TraceContext::new_root(true), name).finish()
    }

    fn recording_factory(transport: Arc<RecordingTransport>) -> impl TransportFactory {
        move |_config: &TransportConfig| -> Result<Arc<dyn TransportBoxed>, TransportError> {
            Ok(Arc::clone(&transport) as Arc<dyn TransportBoxed>)
        }
    }

    #[tokio::test]
    async fn test_unrefreshed_pipeline_queues_spans() {
        let pipeline = RefreshablePipeline::new(recording_factory(Arc::new(RecordingTransport::new())));
        pipeline.report(span("early"));

        assert_eq!(pipeline.pending(), 1);
        assert_eq!(pipeline.flush().await, 0);
        assert_eq!(pipeline.transport_name().await, None);
        assert!(!pipeline.is_enabled().await);
    }

    #[tokio::test]
    async fn test_flush_sends_through_installed_transport() {
        let transport = Arc::new(RecordingTransport::new());
        let pipeline = RefreshablePipeline::new(recording_factory(transport.clone()));
        let config = TransportConfig::enabled(Endpoint::Noop)
            .with_batch_limits(2, 1_000_000)
            .with_flush_timeout(Duration::from_secs(60));
        pipeline.refresh(config).await;

        for name in ["a", "b", "c"] {
            pipeline.report(span(name));
        }
        // The pressure flush may already have taken the first pair.
        pipeline.flush().await;

        assert_eq!(transport.span_names(), ["a", "b", "c"]);
        assert!(transport.batch_sizes().iter().all(|&n| n <= 2));
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    async fn test_refresh_closes_previous_transport() {
        let first = Arc::new(RecordingTransport::new());
        let second = Arc::new(RecordingTransport::new());
        let transports = std::sync::Mutex::new(vec![second.clone(), first.clone()]);
        let factory = move |_config: &TransportConfig| -> Result<Arc<dyn TransportBoxed>, TransportError> {
            let next = transports.lock().unwrap().pop().ok_or(TransportError::Closed)?;
            Ok(next as Arc<dyn TransportBoxed>)
        };
        let pipeline = RefreshablePipeline::new(factory);

        pipeline.refresh(TransportConfig::enabled(Endpoint::Noop)).await;
        assert!(!first.is_closed());
        pipeline.refresh(TransportConfig::enabled(Endpoint::Noop)).await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(pipeline.metrics().refreshes(), 2);
    }

    #[tokio::test]
    async fn test_build_failure_falls_back_to_noop() {
        let factory = |_config: &TransportConfig| -> Result<Arc<dyn TransportBoxed>, TransportError> {
            Err(TransportError::InvalidEndpoint("unreachable".to_string()))
        };
        let pipeline = RefreshablePipeline::new(factory);
        pipeline.refresh(TransportConfig::enabled(Endpoint::Noop)).await;

        assert_eq!(pipeline.transport_name().await.as_deref(), Some("noop"));
        assert!(!pipeline.is_enabled().await);
        assert_eq!(pipeline.metrics().transport_build_failures(), 1);

        pipeline.report(span("discarded"));
        assert_eq!(pipeline.flush().await, 1);
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_disables_reporting() {
        let transport = Arc::new(RecordingTransport::new());
        let pipeline = RefreshablePipeline::new(recording_factory(transport.clone()));
        pipeline
            .refresh(TransportConfig::enabled(Endpoint::Noop).with_batch_limits(0, 10))
            .await;

        assert_eq!(pipeline.transport_name().await.as_deref(), Some("noop"));
        pipeline.report(span("x"));
        pipeline.flush().await;
        assert!(transport.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let transport = Arc::new(RecordingTransport::new());
        let pipeline = RefreshablePipeline::new(recording_factory(transport.clone()));
        pipeline
            .refresh(TransportConfig::enabled(Endpoint::Noop).with_flush_timeout(Duration::from_secs(60)))
            .await;

        pipeline.report(span("last"));
        pipeline.shutdown().await;
        pipeline.shutdown().await;

        assert_eq!(transport.span_names(), ["last"]);
        assert!(transport.is_closed());
        assert_eq!(pipeline.transport_name().await, None);
    }

    #[tokio::test]
    async fn test_pipeline_as_reporter() {
        let pipeline = Arc::new(RefreshablePipeline::new(recording_factory(Arc::new(RecordingTransport::new()))));
        let reporter: Arc<dyn Reporter> = pipeline.clone();
        reporter.report(span("via-trait"));
        assert_eq!(pipeline.pending(), 1);
        assert_eq!(pipeline.metrics().spans_reported(), 1);
    }
}
