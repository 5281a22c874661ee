use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use dere_core::config::PRESENCE_STALE_SECS;
use dere_presence::types::ChannelInfo;

use crate::app::AppState;

fn storage_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub medium: String,
    pub user_id: String,
    pub available_channels: Vec<ChannelInfo>,
}

/// POST /presence/register — adapter announces itself and its destinations.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .presence
        .register(&req.medium, &req.user_id, &req.available_channels)
        .map_err(storage_error)?;
    Ok(Json(json!({ "status": "registered" })))
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub medium: String,
    pub user_id: String,
}

/// POST /presence/heartbeat — adapters call this every 30 s.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .presence
        .heartbeat(&req.medium, &req.user_id)
        .map_err(storage_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// POST /presence/unregister — clean adapter shutdown.
pub async fn unregister(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .presence
        .unregister(&req.medium, &req.user_id)
        .map_err(storage_error)?;
    Ok(Json(json!({ "status": "unregistered" })))
}

#[derive(Deserialize)]
pub struct AvailableQuery {
    pub user_id: String,
}

/// GET /presence/available?user_id=X — online media only.
pub async fn available(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailableQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let entries = state
        .presence
        .list_online(&query.user_id, PRESENCE_STALE_SECS)
        .map_err(storage_error)?;
    Ok(Json(json!({
        "mediums": entries
            .iter()
            .map(|e| json!({
                "medium": e.medium,
                "available_channels": e.available_channels,
                "last_heartbeat": e.last_heartbeat,
            }))
            .collect::<Vec<_>>()
    })))
}
