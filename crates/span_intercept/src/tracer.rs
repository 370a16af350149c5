use crate::propagation::{AlwaysSample, Sampler};
use crate::scope::ScopeStack;
use span_relay::{ActiveSpan, Reporter, TraceContext};
use std::sync::Arc;

/// Starts spans, keeps the scope stack and hands finished spans to a reporter.
///
/// Cheap to clone; clones share the reporter, the sampler and the scopes.
#[derive(Clone)]
pub struct Tracer {
    reporter: Arc<dyn Reporter>,
    sampler: Arc<dyn Sampler>,
    scopes: ScopeStack,
}

impl Tracer {
    /// Creates a tracer that samples every new trace.
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            sampler: Arc::new(AlwaysSample),
            scopes: ScopeStack::new(),
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Shares an existing scope stack, e.g. with another tracer.
    pub fn with_scopes(mut self, scopes: ScopeStack) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn scopes(&self) -> &ScopeStack {
        &self.scopes
    }

    /// Innermost context entered on the calling thread.
    pub fn current_context(&self) -> Option<TraceContext> {
        self.scopes.current()
    }

    /// Context for a new span: a child of `parent`, or a new root whose
    /// sampling decision comes from the sampler.
    pub fn next_context(&self, parent: Option<TraceContext>) -> TraceContext {
        match parent {
            Some(parent) => parent.child(),
            None => {
                let root = TraceContext::new_root(true);
                TraceContext::new(root.trace_id(), root.span_id(), None, self.sampler.sample(root.trace_id()))
            }
        }
    }

    pub fn start_span(&self, parent: Option<TraceContext>, name: impl Into<String>) -> ActiveSpan {
        ActiveSpan::start(self.next_context(parent), name)
    }

    /// Finishes the span and reports it when its trace is sampled.
    pub fn finish(&self, span: ActiveSpan) {
        let span = span.finish();
        if span.context().sampled() {
            self.reporter.report(span);
        }
    }

    /// Runs `f` with `context` current on this thread.
    pub fn in_scope<R>(&self, context: TraceContext, f: impl FnOnce() -> R) -> R {
        let _scope = self.scopes.enter(context);
        f()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::NeverSample;
    use span_relay::Span;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collected(Mutex<Vec<Span>>);

    impl Reporter for Collected {
        fn report(&self, span: Span) {
            self.0.lock().unwrap().push(span);
        }
    }

    #[test]
    fn test_unsampled_spans_are_not_reported() {
        let collected = Arc::new(Collected::default());
        let tracer = Tracer::new(collected.clone()).with_sampler(NeverSample);

        let span = tracer.start_span(None, "quiet");
        assert!(!span.context().sampled());
        tracer.finish(span);

        assert!(collected.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_child_inherits_parent_decision() {
        let tracer = Tracer::new(Arc::new(Collected::default())).with_sampler(NeverSample);
        let parent = TraceContext::new_root(true);

        let context = tracer.next_context(Some(parent));
        assert!(context.sampled());
        assert_eq!(context.trace_id(), parent.trace_id());
        assert_eq!(context.parent_span_id(), Some(parent.span_id()));
    }

    #[test]
    fn test_sampler_sees_trace_id() {
        let tracer = Tracer::new(Arc::new(Collected::default())).with_sampler(|trace_id: u128| trace_id % 2 == 0);
        for _ in 0..16 {
            let context = tracer.next_context(None);
            assert_eq!(context.sampled(), context.trace_id() % 2 == 0);
        }
    }

    #[test]
    fn test_in_scope_sets_current_context() {
        let tracer = Tracer::new(Arc::new(Collected::default()));
        let context = TraceContext::new_root(true);

        let seen = tracer.in_scope(context, || tracer.current_context());
        assert_eq!(seen, Some(context));
        assert_eq!(tracer.current_context(), None);
    }
}
