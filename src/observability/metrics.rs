//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (cache outcomes, revalidations, origin calls, tunnels)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_cache_lookups_total` (counter): lookups by outcome (miss, fresh, stale)
//! - `proxy_cache_stores_total` (counter): responses written to the cache
//! - `proxy_cache_evictions_total` (counter): entries dropped to stay within the size budget
//! - `proxy_revalidations_total` (counter): conditional requests by result
//! - `proxy_upstream_requests_total` (counter): origin round trips by outcome
//! - `proxy_tunnels_total` (counter): CONNECT tunnels by outcome
//! - `proxy_request_duration_seconds` (histogram): latency by method, status
//! - `proxy_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Labels are low cardinality: no hosts or paths

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start_time: Instant) {
    histogram!(
        "proxy_request_duration_seconds",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(start_time.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(outcome: &'static str) {
    counter!("proxy_cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_store() {
    counter!("proxy_cache_stores_total").increment(1);
}

pub fn record_cache_eviction() {
    counter!("proxy_cache_evictions_total").increment(1);
}

pub fn record_revalidation(result: &'static str) {
    counter!("proxy_revalidations_total", "result" => result).increment(1);
}

pub fn record_upstream(outcome: &'static str) {
    counter!("proxy_upstream_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_tunnel(outcome: &'static str) {
    counter!("proxy_tunnels_total", "outcome" => outcome).increment(1);
}

pub fn record_active_connections(count: usize) {
    gauge!("proxy_active_connections").set(count as f64);
}
