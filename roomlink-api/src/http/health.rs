//! Health check endpoints
//!
//! `/health` for generic liveness checks, `/rooms/health` for the balancer's monitor.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::http::MediaState;

/// Health check router
pub fn create_health_router() -> Router<MediaState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/rooms/health", get(rooms_health))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn rooms_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
