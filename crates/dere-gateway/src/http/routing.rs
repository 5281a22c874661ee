use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use dere_core::types::Priority;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct DecideRequest {
    pub user_id: String,
    pub message: String,
    pub priority: String,
    #[serde(default)]
    pub user_activity: Value,
}

/// POST /routing/decide — pick a reachable (medium, location) for a message.
pub async fn decide(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DecideRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let priority: Priority = req
        .priority
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))))?;

    match state
        .router
        .decide(&req.user_id, &req.message, priority, &req.user_activity)
        .await
    {
        Some(decision) => Ok(Json(json!({
            "medium": decision.medium,
            "location": decision.location,
            "reasoning": decision.reasoning,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no reachable destination" })),
        )),
    }
}
