//! Prometheus metrics for the relay
//!
//! Exposed through `GET /metrics` by the HTTP layer.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Sessions currently bound to a resource
pub static SESSIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "feedrelay_sessions_active",
        "Number of subscriber sessions currently registered",
        REGISTRY.clone()
    )
    .expect("Failed to register SESSIONS_ACTIVE")
});

/// Resources with a stored snapshot
pub static RESOURCES_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "feedrelay_resources_active",
        "Number of resources holding a snapshot",
        REGISTRY.clone()
    )
    .expect("Failed to register RESOURCES_ACTIVE")
});

/// Per-session delivery attempts, by outcome (delivered, dropped, pruned)
pub static DELIVERIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "feedrelay_deliveries_total",
        "Snapshot deliveries to individual sessions",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register DELIVERIES_TOTAL")
});

/// Outbound "resource requested" signals, by outcome (sent, failed, dropped)
pub static UPSTREAM_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "feedrelay_upstream_requests_total",
        "Resource requests sent to upstream producers",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register UPSTREAM_REQUESTS_TOTAL")
});

/// Inbound updates, by outcome (applied, malformed, unauthorized, rejected)
pub static UPDATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "feedrelay_updates_total",
        "Resource updates received from upstream producers",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register UPDATES_TOTAL")
});

pub fn record_delivery(outcome: &str, count: usize) {
    if count > 0 {
        DELIVERIES_TOTAL
            .with_label_values(&[outcome])
            .inc_by(count as u64);
    }
}

pub fn record_upstream_request(outcome: &str) {
    UPSTREAM_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_update(outcome: &str) {
    UPDATES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Render all metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
