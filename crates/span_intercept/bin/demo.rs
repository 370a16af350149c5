//! # Intercept Demo
//!
//! Traces a simulated message producer whose `send` completes through a
//! callback on a broker I/O thread. Spans go through a
//! [`RefreshablePipeline`] to stdout.
//!
//! ## Running
//!
//! ```bash
//! cargo run -p span_intercept --bin intercept_demo
//! RUST_LOG=span_intercept=debug,span_relay=debug cargo run -p span_intercept --bin intercept_demo
//! ```

use span_intercept::{
    CallShape, HeaderMap, Interceptor, InterceptorChain, InvocationContext, MethodInfo, Next, Propagation, Tracer,
    TracingInterceptor,
};
use span_relay::{DefaultTransportFactory, Endpoint, RefreshablePipeline, SpanKind, TraceContext, TransportConfig};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const RECORDS: u64 = 12;

/// `b3: {trace_id}-{span_id}-{sampled}` single-header format.
struct B3SingleHeader;

impl Propagation for B3SingleHeader {
    fn extract(&self, carrier: &HeaderMap) -> Option<TraceContext> {
        let mut parts = carrier.get("b3")?.split('-');
        let trace_id = u128::from_str_radix(parts.next()?, 16).ok()?;
        let span_id = u64::from_str_radix(parts.next()?, 16).ok()?;
        let sampled = parts.next().map_or(true, |flag| flag == "1");
        Some(TraceContext::new(trace_id, span_id, None, sampled))
    }

    fn inject(&self, context: &TraceContext, carrier: &mut HeaderMap) {
        carrier.insert(
            "b3".to_string(),
            format!(
                "{:032x}-{:016x}-{}",
                context.trace_id(),
                context.span_id(),
                u8::from(context.sampled())
            ),
        );
    }
}

/// Stage that logs how long each call took to return.
struct TimingInterceptor;

struct StartedAt(Instant);

impl<T, E: std::fmt::Display> Interceptor<T, E> for TimingInterceptor {
    fn before(&self, call: &mut MethodInfo<T, E>, ctx: &mut InvocationContext, next: Next<'_, T, E>) {
        ctx.insert(StartedAt(Instant::now()));
        next.proceed(call, ctx);
    }

    fn after(
        &self,
        call: &mut MethodInfo<T, E>,
        ctx: &mut InvocationContext,
        outcome: Result<(), &E>,
        next: Next<'_, T, E>,
    ) {
        if let Some(StartedAt(started)) = ctx.remove::<StartedAt>() {
            info!(
                operation = call.operation(),
                returned_in_us = started.elapsed().as_micros() as u64,
                failed = outcome.is_err(),
                "call returned"
            );
        }
        next.proceed(call, ctx);
    }
}

/// Broker stand-in: acknowledges each record on its own I/O thread.
fn broker_send(record: u64, headers: &HeaderMap, callback: impl FnOnce(Result<u64, String>) + Send + 'static) {
    let traced = headers.contains_key("b3");
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(5 + record % 4 * 10));
        let result = if record % 5 == 4 {
            Err(format!("record {record}: not enough replicas"))
        } else {
            Ok(record * 100)
        };
        info!(record, traced, "broker acknowledged");
        callback(result);
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pipeline = Arc::new(RefreshablePipeline::new(DefaultTransportFactory));
    pipeline
        .refresh(
            TransportConfig::enabled(Endpoint::Stdout { verbose: true })
                .with_batch_limits(5, 64 * 1024)
                .with_flush_timeout(Duration::from_millis(100)),
        )
        .await;

    let tracer = Tracer::new(pipeline.clone());
    let chain: InterceptorChain<u64, String> = InterceptorChain::new()
        .with(TimingInterceptor)
        .with(TracingInterceptor::new(tracer.clone(), B3SingleHeader).with_kind(SpanKind::Producer));

    let (acks_tx, acks_rx) = mpsc::channel();
    let parent = tracer.start_span(None, "publish-batch");
    let parent_context = *parent.context();

    for record in 0..RECORDS {
        let acks = acks_tx.clone();
        let mut call = MethodInfo::new("send")
            .with_remote_service("kafka")
            .with_destination("broker-1:9092")
            .with_tag("record", record.to_string())
            .with_callback(move |result: Result<u64, String>| {
                let _ = acks.send(result);
            });

        tracer
            .in_scope(parent_context, || {
                chain.invoke(&mut call, InvocationContext::with_shape(CallShape::Async), |call| {
                    let Some(callback) = call.take_callback() else {
                        return Err("send without a callback".to_string());
                    };
                    broker_send(record, call.outgoing(), callback);
                    Ok(record)
                })
            })
            .map_err(anyhow::Error::msg)?;
    }
    drop(acks_tx);
    tracer.finish(parent);

    let (ok, failed) = acks_rx
        .iter()
        .take(RECORDS as usize)
        .fold((0, 0), |(ok, failed), ack| match ack {
            Ok(_) => (ok + 1, failed),
            Err(_) => (ok, failed + 1),
        });
    println!("\nacknowledged: {ok} ok, {failed} failed\n");

    pipeline.shutdown().await;
    let snapshot = pipeline.metrics().snapshot();
    println!(
        "reported={} sent={} batches={} dropped={}",
        snapshot.spans_reported, snapshot.spans_sent, snapshot.batches_sent, snapshot.spans_dropped
    );
    Ok(())
}
