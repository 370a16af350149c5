//! # Span Relay Demo
//!
//! Drives a [`RefreshablePipeline`] through a live reconfiguration while
//! producer tasks keep reporting spans.
//!
//! ## Phases
//! 1. Refresh to a stdout transport (or the endpoint from a config file)
//! 2. Producers report spans while the pipeline is refreshed to disabled and back
//! 3. Graceful shutdown and a metrics dump
//!
//! ## Running
//!
//! ```bash
//! cargo run -p span_relay --bin relay_demo
//!
//! # Ship to a file or a TCP collector described in JSON
//! cargo run -p span_relay --bin relay_demo -- --config relay.json
//!
//! # Per-span output and debug logs
//! RUST_LOG=span_relay=debug cargo run -p span_relay --bin relay_demo -- --verbose
//! ```
//!
//! Example `relay.json`:
//!
//! ```json
//! { "enabled": true, "endpoint": { "type": "file", "path": "spans.jsonl" }, "max_batch_spans": 50 }
//! ```

use anyhow::Context;
use span_relay::{
    ActiveSpan, DefaultTransportFactory, Endpoint, RefreshablePipeline, SpanKind, TraceContext, TransportConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PRODUCERS: usize = 4;
const SPANS_PER_PRODUCER: usize = 50;

fn load_config(args: &[String], verbose: bool) -> anyhow::Result<TransportConfig> {
    let Some(index) = args.iter().position(|a| a == "--config") else {
        return Ok(TransportConfig::enabled(Endpoint::Stdout { verbose })
            .with_batch_limits(25, 64 * 1024)
            .with_flush_timeout(Duration::from_millis(200)));
    };
    let path = args.get(index + 1).context("--config needs a path")?;
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: TransportConfig = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    config.validate()?;
    Ok(config)
}

async fn produce(pipeline: Arc<RefreshablePipeline>, producer: usize) {
    let root = TraceContext::new_root(true);
    for seq in 0..SPANS_PER_PRODUCER {
        let mut span = ActiveSpan::start(root.child(), format!("producer-{producer}/op-{seq}"))
            .with_kind(SpanKind::Producer);
        span.set_remote_service_name("demo-broker");
        span.tag("producer", producer.to_string());
        if seq % 10 == 9 {
            span.error("simulated failure");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        pipeline.report(span.finish());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let config = load_config(&args, verbose)?;

    println!("Phase 1: installing {:?}\n", config.endpoint);
    let pipeline = Arc::new(RefreshablePipeline::new(DefaultTransportFactory));
    pipeline.refresh(config.clone()).await;

    println!("Phase 2: {PRODUCERS} producers x {SPANS_PER_PRODUCER} spans, with live refreshes\n");
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| tokio::spawn(produce(Arc::clone(&pipeline), id)))
        .collect();

    tokio::time::sleep(Duration::from_millis(80)).await;
    pipeline.refresh(TransportConfig::disabled()).await;
    println!("   refreshed: reporting disabled");
    tokio::time::sleep(Duration::from_millis(80)).await;
    pipeline.refresh(config).await;
    println!("   refreshed: reporting enabled again\n");

    for producer in producers {
        producer.await.context("producer task failed")?;
    }

    println!("Phase 3: shutdown\n");
    pipeline.shutdown().await;

    let snapshot = pipeline.metrics().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
