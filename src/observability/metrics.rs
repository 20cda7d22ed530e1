//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define fleet metrics (requests, latency, reloads, workers, listeners)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `httpd_requests_total` (counter): requests by status
//! - `httpd_request_duration_seconds` (histogram): latency distribution
//! - `httpd_reloads_total` (counter): reload cycles by outcome
//! - `httpd_workers` (gauge): live workers
//! - `httpd_worker_exits_total` (counter): worker exits by reason
//! - `httpd_listeners` (gauge): open listening sockets
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are low-cardinality (status code, outcome, reason)

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, start: Instant) {
    metrics::counter!("httpd_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("httpd_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// `outcome` is one of `applied`, `unchanged`, `rejected`, `failed`.
pub fn record_reload(outcome: &'static str) {
    metrics::counter!("httpd_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_workers(count: usize) {
    metrics::gauge!("httpd_workers").set(count as f64);
}

pub fn record_worker_exit(reason: &'static str) {
    metrics::counter!("httpd_worker_exits_total", "reason" => reason).increment(1);
}

pub fn record_listeners(count: usize) {
    metrics::gauge!("httpd_listeners").set(count as f64);
}
