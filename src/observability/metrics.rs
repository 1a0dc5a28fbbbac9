//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define front-end metrics (connections, requests, evictions, errors)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `hostbridge_connections_accepted_total` (counter)
//! - `hostbridge_idle_evictions_total` (counter)
//! - `hostbridge_connections_reused_total` (counter)
//! - `hostbridge_requests_total` (counter): by transport, status
//! - `hostbridge_request_duration_seconds` (histogram): by transport
//! - `hostbridge_inflight_requests` (gauge)
//! - `hostbridge_active_workers` (gauge)
//! - `hostbridge_backend_contexts_created_total` (counter)
//! - `hostbridge_protocol_errors_total` (counter): by kind
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    counter!("hostbridge_connections_accepted_total").increment(1);
}

pub fn record_idle_eviction(count: usize) {
    counter!("hostbridge_idle_evictions_total").increment(count as u64);
}

pub fn record_connection_reused() {
    counter!("hostbridge_connections_reused_total").increment(1);
}

pub fn record_request(transport: &'static str, status: u16, start: Instant) {
    counter!(
        "hostbridge_requests_total",
        "transport" => transport,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("hostbridge_request_duration_seconds", "transport" => transport)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_inflight_requests(count: usize) {
    gauge!("hostbridge_inflight_requests").set(count as f64);
}

pub fn set_active_workers(count: u64) {
    gauge!("hostbridge_active_workers").set(count as f64);
}

pub fn record_context_created() {
    counter!("hostbridge_backend_contexts_created_total").increment(1);
}

pub fn record_protocol_error(kind: &'static str) {
    counter!("hostbridge_protocol_errors_total", "kind" => kind).increment(1);
}
