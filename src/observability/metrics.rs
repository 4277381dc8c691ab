//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_sessions_created_total` (counter): multiplexed sessions by backend
//! - `gateway_messages_forwarded_total` (counter): messages by backend, direction
//! - `gateway_backend_spawn_failures_total` (counter): failed spawns by backend
//! - `gateway_active_conversations` (gauge): live conversations by backend
//!
//! # Design Decisions
//! - The exporter is optional; without it the `metrics` macros hit the no-op recorder
//! - Labels for backend and direction only

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Message travelling from a transport to the backend.
pub const DIRECTION_TO_BACKEND: &str = "to_backend";
/// Message travelling from the backend to a transport.
pub const DIRECTION_TO_CLIENT: &str = "to_client";

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_session_created(backend: &str) {
    metrics::counter!("gateway_sessions_created_total", "backend" => backend.to_string())
        .increment(1);
}

pub fn record_forwarded(backend: &str, direction: &'static str) {
    metrics::counter!(
        "gateway_messages_forwarded_total",
        "backend" => backend.to_string(),
        "direction" => direction
    )
    .increment(1);
}

pub fn record_spawn_failure(backend: &str) {
    metrics::counter!("gateway_backend_spawn_failures_total", "backend" => backend.to_string())
        .increment(1);
}

pub fn record_active_conversations(backend: &str, count: usize) {
    metrics::gauge!("gateway_active_conversations", "backend" => backend.to_string())
        .set(count as f64);
}
