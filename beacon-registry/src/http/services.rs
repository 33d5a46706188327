//! Registration, heartbeat and lookup endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;

use super::{AppError, AppResult, AppState};
use crate::types::{
    DeleteResponse, HeartbeatResponse, RegisterRequest, ServiceRecord, ServiceUpdate,
};

pub fn create_services_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register_service))
        .route("/heartbeat/{name}", post(heartbeat))
        .route("/services", get(list_services))
        .route(
            "/services/{name}",
            get(get_service).put(update_service).delete(delete_service),
        )
}

async fn register_service(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<ServiceRecord>)> {
    let Json(req) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let (name, info) = req.into_parts().map_err(AppError::bad_request)?;
    let record = state.store.register(name, info);
    Ok((StatusCode::CREATED, Json(record)))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<HeartbeatResponse>> {
    let last_heartbeat = state
        .store
        .record_heartbeat(&name)
        .ok_or_else(|| AppError::not_found(format!("Service {name} not found")))?;

    Ok(Json(HeartbeatResponse {
        success: true,
        name,
        last_heartbeat,
    }))
}

async fn update_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<ServiceUpdate>, JsonRejection>,
) -> AppResult<Json<ServiceRecord>> {
    let Json(update) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    state
        .store
        .update(&name, update)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Service {name} not found")))
}

async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ServiceRecord>> {
    state
        .store
        .get(&name)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Service {name} not found")))
}

async fn list_services(State(state): State<AppState>) -> Json<HashMap<String, ServiceRecord>> {
    Json(state.store.get_all())
}

async fn delete_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    if state.store.delete(&name) {
        Ok(Json(DeleteResponse {
            success: true,
            name,
        }))
    } else {
        Err(AppError::not_found(format!("Service {name} not found")))
    }
}
