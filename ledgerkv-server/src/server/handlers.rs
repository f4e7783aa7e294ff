use crate::core::KvError;
use crate::persistence::PersistenceLayer;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub layer: Arc<PersistenceLayer>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub backend: &'static str,
    pub keys: usize,
    pub last_sequence: u64,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let log = state.layer.log();
    Json(HealthResponse {
        status: "healthy",
        service: "ledgerkv",
        version: env!("CARGO_PKG_VERSION"),
        backend: log.backend_name(),
        keys: state.layer.store().len(),
        last_sequence: log.last_sequence(),
    })
}

/// PUT /v1/keys/{key} - body is stored verbatim
pub async fn key_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: String,
) -> Result<StatusCode, KvError> {
    debug!("REST PUT key={}, size={}", key, body.len());

    state.layer.put(&key, &body).await?;
    Ok(StatusCode::CREATED)
}

/// GET /v1/keys/{key}
pub async fn key_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, KvError> {
    debug!("REST GET key={}", key);

    state.layer.get(&key)
}

/// DELETE /v1/keys/{key} - deleting a missing key succeeds
pub async fn key_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, KvError> {
    debug!("REST DELETE key={}", key);

    state.layer.delete(&key).await?;
    Ok(StatusCode::OK)
}
