//! Metrics collection and exposition.
//!
//! # Metrics
//! - `telemetry_records_total` (counter): records by kind and outcome
//!   (`sent`, `failed`, `filtered`, `dropped`)
//! - `tracker_completed_requests_total` (counter): completed requests by status
//! - `tracker_in_flight_requests` (gauge): requests still being aggregated
//! - `store_ingested_total` (counter): records written to the store by kind
//! - `store_query_duration_seconds` (histogram): read path latency by endpoint

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics exporter started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_telemetry(kind: &'static str, outcome: &'static str) {
    metrics::counter!("telemetry_records_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_request_completed(status: &'static str) {
    metrics::counter!("tracker_completed_requests_total", "status" => status).increment(1);
}

pub fn record_in_flight(count: usize) {
    metrics::gauge!("tracker_in_flight_requests").set(count as f64);
}

pub fn record_ingested(kind: &'static str, count: u64) {
    metrics::counter!("store_ingested_total", "kind" => kind).increment(count);
}

pub fn record_query(endpoint: &'static str, started: Instant) {
    metrics::histogram!("store_query_duration_seconds", "endpoint" => endpoint)
        .record(started.elapsed().as_secs_f64());
}
