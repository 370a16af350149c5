use crate::chain::{Interceptor, MethodInfo, Next};
use crate::context::{CallShape, InvocationContext};
use crate::correlator::AsyncCorrelator;
use crate::propagation::Propagation;
use crate::scope::ScopeGuard;
use crate::tracer::Tracer;
use span_relay::{ActiveSpan, SpanKind};
use std::fmt;
use std::sync::Arc;

/// Tag carrying [`MethodInfo::destination`].
pub const DESTINATION_TAG: &str = "peer.destination";

/// What `before` leaves for `after` in the invocation context.
struct InFlight {
    /// `None` once an [`AsyncCorrelator`] owns the span.
    span: Option<ActiveSpan>,
    scope: ScopeGuard,
}

/// Interceptor that records one span per intercepted call.
///
/// The parent is taken from the incoming headers, else from the current scope
/// on the calling thread. The new span's context is injected into the outgoing
/// headers and stays current until the call returns.
///
/// For [`CallShape::Async`] calls with a completion callback, the callback is
/// wrapped so the span is finished when the outcome arrives. Every other call
/// is finished in `after`, with the error recorded if it failed.
pub struct TracingInterceptor {
    tracer: Tracer,
    propagation: Arc<dyn Propagation>,
    kind: SpanKind,
}

impl TracingInterceptor {
    pub fn new(tracer: Tracer, propagation: impl Propagation + 'static) -> Self {
        Self {
            tracer,
            propagation: Arc::new(propagation),
            kind: SpanKind::Client,
        }
    }

    /// Sets the kind of the recorded spans. Defaults to [`SpanKind::Client`].
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    fn start_span<T, E>(&self, call: &MethodInfo<T, E>) -> ActiveSpan {
        let parent = self
            .propagation
            .extract(call.incoming())
            .or_else(|| self.tracer.current_context());

        let mut span = self.tracer.start_span(parent, call.operation()).with_kind(self.kind);
        if let Some(service) = call.remote_service() {
            span.set_remote_service_name(service);
        }
        if let Some(destination) = call.destination() {
            span.tag(DESTINATION_TAG, destination);
        }
        for (key, value) in call.tags() {
            span.tag(key.as_str(), value.as_str());
        }
        span
    }
}

impl<T, E> Interceptor<T, E> for TracingInterceptor
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn before(&self, call: &mut MethodInfo<T, E>, ctx: &mut InvocationContext, next: Next<'_, T, E>) {
        let span = self.start_span(call);
        let context = *span.context();
        self.propagation.inject(&context, call.outgoing_mut());
        let scope = self.tracer.scopes().enter(context);

        let span = match (ctx.shape(), call.take_callback()) {
            (CallShape::Async, Some(callback)) => {
                call.set_callback(AsyncCorrelator::new(self.tracer.clone(), span).wrap(callback));
                None
            }
            (_, callback) => {
                if let Some(callback) = callback {
                    call.set_callback(callback);
                }
                Some(span)
            }
        };
        ctx.insert(InFlight { span, scope });

        next.proceed(call, ctx);
    }

    fn after(
        &self,
        call: &mut MethodInfo<T, E>,
        ctx: &mut InvocationContext,
        outcome: Result<(), &E>,
        next: Next<'_, T, E>,
    ) {
        if let Some(InFlight { span, scope }) = ctx.remove::<InFlight>() {
            scope.release();
            if let Some(mut span) = span {
                if let Err(e) = outcome {
                    span.error(e.to_string());
                }
                self.tracer.finish(span);
            }
        }

        next.proceed(call, ctx);
    }
}

impl fmt::Debug for TracingInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingInterceptor")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
