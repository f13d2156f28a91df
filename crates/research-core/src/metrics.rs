use std::time::Duration;

use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct LoopMetrics {
    search_queries: Counter<u64>,
    documents_added: Counter<u64>,
    rate_limit_wait_ms: Histogram<f64>,
    iterations: Histogram<u64>,
}

static METRICS: OnceCell<LoopMetrics> = OnceCell::new();

fn handles() -> &'static LoopMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("research.loop");
        LoopMetrics {
            search_queries: meter
                .u64_counter("search_queries_total")
                .with_description("Search queries dispatched, by status")
                .init(),
            documents_added: meter
                .u64_counter("search_documents_added_total")
                .with_description("Documents newly added to the document store")
                .init(),
            rate_limit_wait_ms: meter
                .f64_histogram("rate_limit_wait_ms")
                .with_description("Time callers spent waiting on the token bucket")
                .init(),
            iterations: meter
                .u64_histogram("research_iterations")
                .with_description("Completed search iterations per research run")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("RESEARCH_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "RESEARCH_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export loop metrics."
        );
    }
    Ok(())
}

pub(crate) fn record_search_query(status: &'static str) {
    handles()
        .search_queries
        .add(1, &[KeyValue::new("status", status)]);
}

pub(crate) fn record_documents_added(count: usize) {
    if count > 0 {
        handles().documents_added.add(count as u64, &[]);
    }
}

pub(crate) fn record_rate_limit_wait(waited: Duration) {
    handles()
        .rate_limit_wait_ms
        .record(waited.as_secs_f64() * 1_000.0, &[]);
}

pub(crate) fn record_iterations(iterations: u32, stop_reason: &'static str) {
    handles().iterations.record(
        u64::from(iterations),
        &[KeyValue::new("stop_reason", stop_reason)],
    );
}
