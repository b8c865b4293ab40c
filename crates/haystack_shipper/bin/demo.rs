//! # Haystack Shipper Demo
//!
//! Generates synthetic spans from a few fake services and ships them through a
//! [`SpanWriter`]. Configuration comes from a YAML file (`--config`) or the
//! `HAYSTACK_*` / `ES_TAGS_AS_FIELDS_*` environment variables.
//!
//! ## Running
//!
//! ```bash
//! # Print batches to stdout instead of posting them
//! cargo run -p haystack_shipper --bin demo -- --dry-run --spans 500
//!
//! # Ship to a proxy
//! HAYSTACK_PROXY_URL=http://localhost:35000/spans HAYSTACK_PROXY_AUTH_TOKEN=token \
//!     cargo run -p haystack_shipper --bin demo -- --producers 4
//! ```

use anyhow::Context;
use clap::Parser;
use haystack_shipper::{
    KeyValue, Process, RefType, ShipperConfig, Span, SpanId, SpanRef, SpanWriter, StdoutSink,
    TraceId,
};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICES: &[(&str, &[&str])] = &[
    ("frontend", &["/cart", "/checkout", "/product"]),
    ("cart", &["GetCart", "AddItem", "EmptyCart"]),
    ("payment", &["Charge", "Refund"]),
    ("shipping", &["GetQuote", "ShipOrder"]),
];

#[derive(Debug, Parser)]
#[command(name = "demo", about = "Ship synthetic spans to a Haystack proxy")]
struct Args {
    /// YAML configuration file; environment variables are used when absent
    #[arg(long, env = "HAYSTACK_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Spans generated per producer
    #[arg(long, default_value_t = 100)]
    spans: u64,

    /// Concurrent producer tasks
    #[arg(long, default_value_t = 2)]
    producers: u64,

    /// Print batches to stdout instead of posting them
    #[arg(long)]
    dry_run: bool,

    /// Print full batch payloads in dry-run mode
    #[arg(long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<ShipperConfig> {
    match &args.config {
        Some(path) => ShipperConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None if args.dry_run => Ok(ShipperConfig::new("http://localhost:35000/spans", "dry-run")),
        None => ShipperConfig::from_env().context("failed to load configuration from environment"),
    }
}

fn synthetic_span(producer: u64, seq: u64) -> Span {
    let mut rng = rand::thread_rng();
    let (service, operations) = SERVICES[rng.gen_range(0..SERVICES.len())];
    let operation = operations[rng.gen_range(0..operations.len())];

    let trace_id = TraceId::new(rng.gen(), rng.gen());
    let span_id = SpanId(producer << 32 | seq);
    let mut process = Process::new(service);
    process.tags.push(KeyValue::string("hostname", format!("{service}-{producer}")));

    let mut span = Span::new(trace_id, span_id, operation, process)
        .with_duration(Duration::from_micros(rng.gen_range(50..250_000)))
        .with_tag(KeyValue::string("span.kind", "server"))
        .with_tag(KeyValue::int64("http.status_code", 200));

    if rng.gen_bool(0.8) {
        span = span.with_reference(SpanRef {
            ref_type: RefType::ChildOf,
            trace_id,
            span_id: SpanId(rng.gen()),
        });
    }
    if rng.gen_bool(0.1) {
        span = span
            .with_tag(KeyValue::bool("error", true))
            .with_tag(KeyValue::string("error.message", "upstream timeout"));
    }
    span
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let writer = if args.dry_run {
        SpanWriter::new(config, Arc::new(StdoutSink::new(args.verbose)))?
    } else {
        SpanWriter::from_config(config)?
    };
    let writer = Arc::new(writer);

    let start = Instant::now();
    let mut tasks = Vec::new();
    for producer in 0..args.producers {
        let writer = Arc::clone(&writer);
        let spans = args.spans;
        tasks.push(tokio::spawn(async move {
            for seq in 0..spans {
                writer.write_span(&synthetic_span(producer, seq)).await?;
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    writer.close().await?;
    let elapsed = start.elapsed();

    let metrics = writer.metrics();
    info!(
        spans = args.spans * args.producers,
        commits_succeeded = metrics.commits_succeeded(),
        commits_failed = metrics.commits_failed(),
        events_committed = metrics.events_committed(),
        events_dropped = metrics.events_dropped(),
        mean_commit_ms = metrics.mean_commit_duration().as_secs_f64() * 1000.0,
        elapsed_ms = elapsed.as_millis() as u64,
        "demo finished"
    );
    Ok(())
}
