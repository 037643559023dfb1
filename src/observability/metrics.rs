//! Metrics collection and exposition.
//!
//! # Metrics
//! - `retry_attempts_total` (counter): attempts by middleware, outcome
//! - `retry_requests_total` (counter): settled requests by middleware, status
//! - `retry_attempts_per_request` (histogram): attempts spent per request
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Recording is a no-op until a recorder is installed

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics recorder"),
    }
}

/// Record one attempt and what happened to its output.
pub fn record_attempt(middleware: &str, outcome: &'static str) {
    counter!(
        "retry_attempts_total",
        "middleware" => middleware.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a settled request.
pub fn record_settled(middleware: &str, status: Option<u16>, attempts: u32) {
    let status = status.map_or_else(|| "passthrough".to_string(), |s| s.to_string());
    counter!(
        "retry_requests_total",
        "middleware" => middleware.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("retry_attempts_per_request", "middleware" => middleware.to_string())
        .record(f64::from(attempts));
}
