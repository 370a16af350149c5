//! Interceptor chain.
//!
//! ```text
//!   invoke(call, ctx, op)
//!     ├─ stage[0].before ─ next ─► stage[1].before ─ next ─► ... stage[n].before
//!     ├─ op(call)                       (always runs)
//!     └─ stage[k].after ─ next ─► ... stage[0].after   (k = last stage whose before ran)
//! ```
//!
//! A stage continues the chain by calling [`Next::proceed`]. A `before` hook
//! that does not proceed skips the `before` hooks after it, and the stages it
//! skipped get no `after` either. The operation's result is returned as is.

use crate::context::InvocationContext;
use crate::propagation::HeaderMap;
use std::sync::Arc;

/// Completion callback of a callback-style call.
pub type Callback<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// What an interceptor sees of the intercepted call.
pub struct MethodInfo<T, E> {
    operation: String,
    remote_service: Option<String>,
    destination: Option<String>,
    tags: Vec<(String, String)>,
    incoming: HeaderMap,
    outgoing: HeaderMap,
    callback: Option<Callback<T, E>>,
}

impl<T, E> MethodInfo<T, E> {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            remote_service: None,
            destination: None,
            tags: Vec::new(),
            incoming: HeaderMap::new(),
            outgoing: HeaderMap::new(),
            callback: None,
        }
    }

    /// Name of the remote service the call talks to, e.g. `kafka`.
    pub fn with_remote_service(mut self, service: impl Into<String>) -> Self {
        self.remote_service = Some(service.into());
        self
    }

    /// Destination within the remote service, e.g. a broker address or a topic.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Headers received with the call, searched for a parent context.
    pub fn with_incoming(mut self, headers: HeaderMap) -> Self {
        self.incoming = headers;
        self
    }

    pub fn with_callback(mut self, callback: impl FnOnce(Result<T, E>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn remote_service(&self) -> Option<&str> {
        self.remote_service.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn incoming(&self) -> &HeaderMap {
        &self.incoming
    }

    /// Headers sent with the call.
    pub fn outgoing(&self) -> &HeaderMap {
        &self.outgoing
    }

    pub fn outgoing_mut(&mut self) -> &mut HeaderMap {
        &mut self.outgoing
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn take_callback(&mut self) -> Option<Callback<T, E>> {
        self.callback.take()
    }

    /// Replaces the completion callback, e.g. with a wrapping one.
    pub fn set_callback(&mut self, callback: Callback<T, E>) {
        self.callback = Some(callback);
    }
}

impl<T, E> std::fmt::Debug for MethodInfo<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInfo")
            .field("operation", &self.operation)
            .field("remote_service", &self.remote_service)
            .field("destination", &self.destination)
            .field("tags", &self.tags)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// A stage of an [`InterceptorChain`].
pub trait Interceptor<T, E>: Send + Sync {
    /// Runs before the operation. Call `next.proceed(call, ctx)` to continue.
    fn before(&self, call: &mut MethodInfo<T, E>, ctx: &mut InvocationContext, next: Next<'_, T, E>);

    /// Runs after the operation returned, with its outcome. Call
    /// `next.proceed(call, ctx)` to continue.
    fn after(
        &self,
        call: &mut MethodInfo<T, E>,
        ctx: &mut InvocationContext,
        outcome: Result<(), &E>,
        next: Next<'_, T, E>,
    );
}

type Stage<T, E> = Arc<dyn Interceptor<T, E>>;

enum Step<'a, E> {
    Before { entered: &'a mut usize },
    After { outcome: Result<(), &'a E> },
}

/// The rest of the chain, handed to each hook.
pub struct Next<'a, T, E> {
    stages: &'a [Stage<T, E>],
    step: Step<'a, E>,
}

impl<'a, T, E> Next<'a, T, E> {
    /// Runs the next stage's hook, or returns when none is left.
    pub fn proceed(self, call: &mut MethodInfo<T, E>, ctx: &mut InvocationContext) {
        match self.step {
            Step::Before { entered } => {
                let Some((stage, rest)) = self.stages.split_first() else {
                    return;
                };
                *entered += 1;
                stage.before(
                    call,
                    ctx,
                    Next {
                        stages: rest,
                        step: Step::Before { entered },
                    },
                );
            }
            Step::After { outcome } => {
                let Some((stage, rest)) = self.stages.split_last() else {
                    return;
                };
                stage.after(
                    call,
                    ctx,
                    outcome,
                    Next {
                        stages: rest,
                        step: Step::After { outcome },
                    },
                );
            }
        }
    }

    /// Number of stages still to run.
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}

/// Ordered list of interceptors wrapped around a call.
pub struct InterceptorChain<T, E> {
    stages: Vec<Stage<T, E>>,
}

impl<T, E> InterceptorChain<T, E> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage; stages run `before` in insertion order.
    pub fn with(mut self, stage: impl Interceptor<T, E> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn push(&mut self, stage: Arc<dyn Interceptor<T, E>>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the chain around `op` and returns `op`'s result unchanged.
    ///
    /// `ctx` lives for this call only. If `op` or a hook panics, whatever the
    /// stages stored in it (scope guards included) is dropped while unwinding.
    pub fn invoke(
        &self,
        call: &mut MethodInfo<T, E>,
        mut ctx: InvocationContext,
        op: impl FnOnce(&mut MethodInfo<T, E>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut entered = 0;
        Next {
            stages: &self.stages,
            step: Step::Before { entered: &mut entered },
        }
        .proceed(call, &mut ctx);

        let result = op(call);

        Next {
            stages: &self.stages[..entered],
            step: Step::After {
                outcome: result.as_ref().map(|_| ()),
            },
        }
        .proceed(call, &mut ctx);

        result
    }
}

impl<T, E> Default for InterceptorChain<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for InterceptorChain<T, E> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}
