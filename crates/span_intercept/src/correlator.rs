//! Finishing spans from completion callbacks.
//!
//! An [`AsyncCorrelator`] owns the span of a callback-style call. Wrapping the
//! call's callback moves the correlator into the wrapper, so the span is
//! finished exactly once: when the callback runs, on whatever thread that is,
//! or when the wrapper is dropped without having run.

use crate::chain::Callback;
use crate::tracer::Tracer;
use span_relay::{ActiveSpan, TraceContext};
use std::fmt;

/// Error recorded on a span whose completion callback was never invoked.
pub const CALLBACK_DROPPED: &str = "completion callback dropped";

/// Owns an active span until the asynchronous outcome of its call is known.
#[derive(Debug)]
pub struct AsyncCorrelator {
    tracer: Tracer,
    context: TraceContext,
    span: Option<ActiveSpan>,
}

impl AsyncCorrelator {
    pub fn new(tracer: Tracer, span: ActiveSpan) -> Self {
        Self {
            tracer,
            context: *span.context(),
            span: Some(span),
        }
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// Records the outcome, then finishes and reports the span.
    pub fn complete<T, E: fmt::Display>(mut self, result: &Result<T, E>) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        if let Err(e) = result {
            span.error(e.to_string());
        }
        self.tracer.finish(span);
    }

    /// Wraps `callback` so that the span is finished first, then `callback`
    /// receives the original result with this span's context current.
    pub fn wrap<T, E>(self, callback: Callback<T, E>) -> Callback<T, E>
    where
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Box::new(move |result: Result<T, E>| {
            let tracer = self.tracer.clone();
            let context = self.context;
            self.complete(&result);
            tracer.in_scope(context, move || callback(result));
        })
    }
}

impl Drop for AsyncCorrelator {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            tracing::debug!(
                trace_id = %format_args!("{:032x}", self.context.trace_id()),
                "finishing span of a call whose callback never ran"
            );
            span.error(CALLBACK_DROPPED);
            self.tracer.finish(span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use span_relay::{Reporter, Span};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Default)]
    struct Collected(Mutex<Vec<Span>>);

    impl Reporter for Collected {
        fn report(&self, span: Span) {
            self.0.lock().unwrap().push(span);
        }
    }

    fn setup() -> (Arc<Collected>, Tracer) {
        let collected = Arc::new(Collected::default());
        let tracer = Tracer::new(collected.clone());
        (collected, tracer)
    }

    #[test]
    fn test_callback_gets_exact_result_after_span_is_reported() {
        let (collected, tracer) = setup();
        let span = tracer.start_span(None, "send");
        let trace_id = span.context().trace_id();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let reports = Arc::clone(&collected);
        let callback: Callback<u64, String> = Box::new(move |result| {
            let reported = reports.0.lock().unwrap().len();
            *sink.lock().unwrap() = Some((result, reported));
        });

        let wrapped = AsyncCorrelator::new(tracer, span).wrap(callback);
        thread::spawn(move || wrapped(Err("broker unavailable".to_string())))
            .join()
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((Err("broker unavailable".to_string()), 1))
        );
        let spans = collected.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].trace_id(), trace_id);
        assert_eq!(spans[0].error(), Some("broker unavailable"));
    }

    #[test]
    fn test_callback_runs_inside_span_scope() {
        let (_collected, tracer) = setup();
        let span = tracer.start_span(None, "send");
        let context = *span.context();

        let scopes = tracer.scopes().clone();
        let current = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&current);
        let callback: Callback<(), String> = Box::new(move |_| {
            *sink.lock().unwrap() = scopes.current();
        });

        let wrapped = AsyncCorrelator::new(tracer.clone(), span).wrap(callback);
        thread::spawn(move || wrapped(Ok(()))).join().unwrap();

        assert_eq!(*current.lock().unwrap(), Some(context));
        assert_eq!(tracer.scopes().depth(), 0);
    }

    #[test]
    fn test_dropped_callback_still_finishes_span() {
        let (collected, tracer) = setup();
        let span = tracer.start_span(None, "send");
        let callback: Callback<(), String> = Box::new(|_| {});

        drop(AsyncCorrelator::new(tracer, span).wrap(callback));

        let spans = collected.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].error(), Some(CALLBACK_DROPPED));
    }
}
