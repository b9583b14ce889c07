//! Client observability metrics
//!
//! Prometheus-compatible metrics for the transport and pool:
//! - Request duration and outcome per method
//! - Pool size and health transitions
//! - Resurrections and sniffs
//! - Circuit-breaker trips

use std::time::{Duration, Instant};

/// Record the duration of one logical request
pub fn record_request_duration(method: &str, duration: Duration) {
    metrics::histogram!(
        "lodestone_request_duration_seconds",
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a completed request
pub fn record_request_success(method: &str, attempts: u32) {
    metrics::counter!(
        "lodestone_requests_total",
        "method" => method.to_string(),
        "status" => "ok",
    )
    .increment(1);
    metrics::histogram!("lodestone_request_attempts").record(f64::from(attempts));
}

/// Record a failed request
pub fn record_request_error(method: &str, error_type: &str) {
    metrics::counter!(
        "lodestone_requests_total",
        "method" => method.to_string(),
        "status" => "error",
    )
    .increment(1);
    metrics::counter!(
        "lodestone_request_errors_total",
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record one retried attempt
pub fn record_retry(method: &str) {
    metrics::counter!(
        "lodestone_request_retries_total",
        "method" => method.to_string(),
    )
    .increment(1);
}

/// Record the current pool membership size
pub fn record_pool_size(size: usize) {
    metrics::gauge!("lodestone_pool_size").set(size as f64);
}

/// Record a connection transitioning to dead
pub fn record_marked_dead(connection_id: &str) {
    metrics::counter!(
        "lodestone_connections_marked_dead_total",
        "connection" => connection_id.to_string(),
    )
    .increment(1);
}

/// Record a connection transitioning back to alive
pub fn record_marked_alive(connection_id: &str) {
    metrics::counter!(
        "lodestone_connections_marked_alive_total",
        "connection" => connection_id.to_string(),
    )
    .increment(1);
}

/// Record a dead connection returning to rotation
pub fn record_resurrection(connection_id: &str, strategy: &str) {
    metrics::counter!(
        "lodestone_resurrections_total",
        "connection" => connection_id.to_string(),
        "strategy" => strategy.to_string(),
    )
    .increment(1);
}

/// Record a topology sniff and the node count it produced
pub fn record_sniff(reason: &str, node_count: usize) {
    metrics::counter!(
        "lodestone_sniffs_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
    metrics::gauge!("lodestone_sniffed_nodes").set(node_count as f64);
}

/// Record a request refused by the memory circuit breaker
pub fn record_breaker_trip() {
    metrics::counter!("lodestone_circuit_breaker_trips_total").increment(1);
}

/// Timer that records request duration and outcome on completion
pub struct RequestTimer {
    method: String,
    start: Instant,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success(self, attempts: u32) {
        record_request_duration(&self.method, self.start.elapsed());
        record_request_success(&self.method, attempts);
    }

    pub fn error(self, error_type: &str) {
        record_request_duration(&self.method, self.start.elapsed());
        record_request_error(&self.method, error_type);
    }
}
