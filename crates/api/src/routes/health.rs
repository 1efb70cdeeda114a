//! Liveness and readiness endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use examhub_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "examhub-notify-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health/ready: 503 while the store is unreachable.
async fn readiness(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.engine.check_store().await?;
    Ok(Json(json!({ "status": "ready" })))
}
