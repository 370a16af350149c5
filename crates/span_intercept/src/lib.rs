//! Call interception with span tracing
//!
//! An [`InterceptorChain`] wraps an instrumented call with ordered
//! before/after stages. The [`TracingInterceptor`] stage opens a span before
//! the call, links it to its parent (from incoming headers or the current
//! scope), and finishes it exactly once: after a synchronous call returns, or
//! from the completion callback of an asynchronous one through an
//! [`AsyncCorrelator`]. Finished spans go to any [`span_relay::Reporter`],
//! typically a [`span_relay::RefreshablePipeline`].
//!
//! # Example
//!
//! ```ignore
//! use span_intercept::{CallShape, InterceptorChain, InvocationContext, MethodInfo, NoPropagation, Tracer, TracingInterceptor};
//!
//! let tracer = Tracer::new(pipeline.clone());
//! let chain = InterceptorChain::new().with(TracingInterceptor::new(tracer, NoPropagation));
//!
//! let mut call = MethodInfo::new("send").with_remote_service("kafka").with_destination("orders");
//! let result: Result<u64, String> = chain.invoke(&mut call, InvocationContext::new(), |call| producer.send(call));
//! ```

pub mod chain;
pub mod context;
pub mod correlator;
pub mod propagation;
pub mod scope;
pub mod tracer;
pub mod tracing_interceptor;

pub use chain::{Callback, Interceptor, InterceptorChain, MethodInfo, Next};
pub use context::{CallShape, InvocationContext};
pub use correlator::{AsyncCorrelator, CALLBACK_DROPPED};
pub use propagation::{AlwaysSample, HeaderMap, NeverSample, NoPropagation, Propagation, Sampler};
pub use scope::{ScopeGuard, ScopeStack};
pub use tracer::Tracer;
pub use tracing_interceptor::{TracingInterceptor, DESTINATION_TAG};
