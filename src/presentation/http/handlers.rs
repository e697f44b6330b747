//! HTTP Handlers
//!
//! Liveness and metrics endpoints; everything else speaks WebSocket.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::infrastructure::metrics;
use crate::startup::AppState;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub rooms: usize,
}

/// Basic health check with registry counts
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.service.registry();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: registry.connection_count(),
        rooms: registry.room_count(),
    })
}

/// Prometheus metrics in text format
pub async fn metrics_handler() -> impl IntoResponse {
    metrics::gather_metrics()
}
