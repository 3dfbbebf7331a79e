//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define shaping metrics (bytes, waits, connections, limits)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `shaper_bytes_written_total` (counter): bytes that reached the transport and were paid for
//! - `shaper_throttle_wait_seconds` (histogram): planned token wait, labelled by `bucket`
//! - `shaper_deadline_exceeded_total` (counter): writes cut short by a deadline
//! - `shaper_active_connections` (gauge): registered connections
//! - `shaper_aggregate_limit_bytes` / `shaper_conn_limit_bytes` (gauges): current caps
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so the library works standalone

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Count bytes written through a shaped connection.
pub fn record_bytes_written(bytes: usize) {
    metrics::counter!("shaper_bytes_written_total").increment(bytes as u64);
}

/// Record how long a chunk has to wait for `bucket` tokens.
pub fn record_throttle_wait(bucket: &'static str, wait: Duration) {
    metrics::histogram!("shaper_throttle_wait_seconds", "bucket" => bucket).record(wait.as_secs_f64());
}

/// Count a write that gave up on its deadline.
pub fn record_deadline_exceeded() {
    metrics::counter!("shaper_deadline_exceeded_total").increment(1);
}

/// Publish the size of the connection registry.
pub fn set_active_connections(count: usize) {
    metrics::gauge!("shaper_active_connections").set(count as f64);
}

/// Publish the current caps.
pub fn set_limits(aggregate: u64, conn: u64) {
    metrics::gauge!("shaper_aggregate_limit_bytes").set(aggregate as f64);
    metrics::gauge!("shaper_conn_limit_bytes").set(conn as f64);
}
