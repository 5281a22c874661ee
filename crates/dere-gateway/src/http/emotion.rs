use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /emotion/summary/{session_id} — collaborator summary, 404 without one.
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(emotion) = &state.emotion else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "emotion engine not configured" })),
        ));
    };
    match emotion.summary(Some(session_id)).await {
        Some(summary) => Ok(Json(json!({ "summary": summary }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no emotion state for session" })),
        )),
    }
}

/// GET /emotion/state — current state; neutral when no collaborator.
pub async fn state(State(app): State<Arc<AppState>>) -> Json<Value> {
    match &app.emotion {
        Some(emotion) => Json(emotion.state().await),
        None => Json(json!({ "emotion_type": "neutral", "intensity": 0 })),
    }
}

/// GET /emotion/history — not tracked by the core; collaborators own it.
pub async fn history() -> Json<Value> {
    Json(json!({ "history": [] }))
}
