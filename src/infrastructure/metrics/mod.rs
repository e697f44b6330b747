//! Prometheus Metrics Module
//!
//! Application-wide metrics collection for the gateway.
//!
//! # Metrics Collected
//! - Active connection gauges by lifecycle state
//! - Published / relayed / dropped message counters
//! - Rate limit rejections
//! - Circuit breaker state per dependency
//! - Lock acquisition attempts per job

use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::infrastructure::breaker::CircuitState;

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active connections by lifecycle state
pub static CONNECTIONS_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("connections_active", "Number of active connections").namespace("chat_gateway"),
        &["state"],
    )
    .expect("Failed to create CONNECTIONS_ACTIVE metric")
});

/// Messages accepted for publishing
pub static MESSAGES_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("messages_published_total", "Total messages published to rooms")
            .namespace("chat_gateway"),
    )
    .expect("Failed to create MESSAGES_PUBLISHED_TOTAL metric")
});

/// Relay batches published to peer processes
pub static RELAY_BATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("relay_batches_total", "Relay batches published to peers")
            .namespace("chat_gateway"),
    )
    .expect("Failed to create RELAY_BATCHES_TOTAL metric")
});

/// Messages dropped by broadcast backpressure
pub static BROADCAST_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "broadcast_dropped_total",
            "Messages dropped from over-full room batches",
        )
        .namespace("chat_gateway"),
    )
    .expect("Failed to create BROADCAST_DROPPED_TOTAL metric")
});

/// Rate limit rejections
pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("rate_limited_total", "Messages rejected by the rate limiter")
            .namespace("chat_gateway"),
    )
    .expect("Failed to create RATE_LIMITED_TOTAL metric")
});

/// Durable append failures (fail-closed path)
pub static STREAM_APPEND_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "stream_append_failures_total",
            "Durable log appends skipped because the store was unavailable",
        )
        .namespace("chat_gateway"),
    )
    .expect("Failed to create STREAM_APPEND_FAILURES_TOTAL metric")
});

/// Circuit breaker state per dependency (0=closed, 1=half-open, 2=open)
pub static CIRCUIT_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new(
            "circuit_state",
            "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        )
        .namespace("chat_gateway"),
        &["dependency"],
    )
    .expect("Failed to create CIRCUIT_STATE metric")
});

/// Lock acquisition attempts per job and outcome
pub static LOCK_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("lock_attempts_total", "Distributed lock acquisition attempts")
            .namespace("chat_gateway"),
        &["job", "outcome"],
    )
    .expect("Failed to create LOCK_ATTEMPTS_TOTAL metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(MESSAGES_PUBLISHED_TOTAL.clone()))
        .expect("Failed to register MESSAGES_PUBLISHED_TOTAL");
    registry
        .register(Box::new(RELAY_BATCHES_TOTAL.clone()))
        .expect("Failed to register RELAY_BATCHES_TOTAL");
    registry
        .register(Box::new(BROADCAST_DROPPED_TOTAL.clone()))
        .expect("Failed to register BROADCAST_DROPPED_TOTAL");
    registry
        .register(Box::new(RATE_LIMITED_TOTAL.clone()))
        .expect("Failed to register RATE_LIMITED_TOTAL");
    registry
        .register(Box::new(STREAM_APPEND_FAILURES_TOTAL.clone()))
        .expect("Failed to register STREAM_APPEND_FAILURES_TOTAL");
    registry
        .register(Box::new(CIRCUIT_STATE.clone()))
        .expect("Failed to register CIRCUIT_STATE");
    registry
        .register(Box::new(LOCK_ATTEMPTS_TOTAL.clone()))
        .expect("Failed to register LOCK_ATTEMPTS_TOTAL");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics should be valid UTF-8")
}

/// Helper to update connection counts per lifecycle state
pub fn set_connections(state: &str, count: usize) {
    CONNECTIONS_ACTIVE
        .with_label_values(&[state])
        .set(count as f64);
}

/// Helper to record an accepted publish
pub fn record_published() {
    MESSAGES_PUBLISHED_TOTAL.inc();
}

/// Helper to record a relayed batch
pub fn record_relay_batch() {
    RELAY_BATCHES_TOTAL.inc();
}

/// Helper to record dropped batch entries
pub fn record_broadcast_dropped(count: usize) {
    BROADCAST_DROPPED_TOTAL.inc_by(count as u64);
}

/// Helper to record a rate limit rejection
pub fn record_rate_limited() {
    RATE_LIMITED_TOTAL.inc();
}

/// Helper to record a skipped durable append
pub fn record_stream_append_failure() {
    STREAM_APPEND_FAILURES_TOTAL.inc();
}

/// Helper to reflect circuit breaker state
pub fn set_circuit_state(dependency: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    CIRCUIT_STATE.with_label_values(&[dependency]).set(value);
}

/// Helper to record a lock acquisition attempt
pub fn record_lock_attempt(job: &str, acquired: bool) {
    let outcome = if acquired { "acquired" } else { "held_elsewhere" };
    LOCK_ATTEMPTS_TOTAL.with_label_values(&[job, outcome]).inc();
}
