//! HTTP API layer: Axum router, handlers, wire models, and errors.

/// API error types mapped to HTTP status codes.
pub mod errors;
/// HTTP request handlers.
pub mod handlers;
/// Prometheus metrics recording.
pub mod metrics;
/// Request and response data transfer objects.
pub mod models;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::controller::Controller;

/// Builds the Axum router for this node.
///
/// Routes:
/// - `POST /api/v1/add` — insert a vector (301 to the owner on a miss)
/// - `POST /api/v1/search` — nearest-neighbor query (301 to the owner)
/// - `POST /mgmt/v1/acquire` — leader-only ownership acquire (308 to leader)
/// - `POST /mgmt/v1/release` — drop a shard's local state
/// - `GET /status`, `GET /health` — liveness probes
/// - `GET /metrics` — Prometheus exposition
pub fn create_router(ctl: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/v1/add", post(handlers::add))
        .route("/api/v1/search", post(handlers::search))
        .route("/mgmt/v1/acquire", post(handlers::acquire))
        .route("/mgmt/v1/release", post(handlers::release))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_endpoint))
        .with_state(ctl)
}
