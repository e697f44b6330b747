//! Route Configuration
//!
//! Configures the HTTP surface: the WebSocket gateway endpoint, health
//! check, and Prometheus metrics.

use axum::{routing::get, Router};

use super::handlers;
use crate::presentation::websocket::ws_handler;
use crate::startup::AppState;

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // WebSocket gateway endpoint
        .route("/ws", get(ws_handler))
        // Health check endpoint
        .route("/health", get(handlers::health_check))
        // Prometheus metrics endpoint
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
