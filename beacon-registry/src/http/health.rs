//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;

use super::AppState;
use crate::types::HealthResponse;

pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Sweeps stale records (when enabled) and reports the live count
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    if state.config.sweep_on_health_check {
        state
            .store
            .remove_stale_services(state.config.stale_after_secs);
    }

    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        services: state.store.count(),
    })
}
