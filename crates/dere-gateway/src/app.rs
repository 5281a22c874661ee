use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use dere_agent::service::EmotionSource;
use dere_agent::AgentService;
use dere_ambient::analyzer::ContextSearch;
use dere_ambient::{AmbientHandle, MessageRouter};
use dere_core::config::DereConfig;
use dere_curiosity::triggers::TriggerCollector;
use dere_curiosity::CuriosityStore;
use dere_notify::NotificationQueue;
use dere_presence::PresenceRegistry;
use dere_sessions::SessionStore;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: DereConfig,
    pub sessions: Arc<SessionStore>,
    pub presence: Arc<PresenceRegistry>,
    pub notifications: Arc<NotificationQueue>,
    pub curiosity: Arc<CuriosityStore>,
    pub collector: TriggerCollector,
    pub agent: Arc<AgentService>,
    pub router: Arc<MessageRouter>,
    /// Emotion collaborator; `/emotion/*` answers 404 / neutral without one.
    pub emotion: Option<Arc<dyn EmotionSource>>,
    /// Retrieval collaborator; `/context/build` reports unavailable without one.
    pub search: Option<Arc<dyn ContextSearch>>,
    /// FSM handle so acknowledgments feed back into the ambient monitor.
    pub ambient: AmbientHandle,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        // Sessions
        .route(
            "/sessions/find_or_create",
            post(crate::http::sessions::find_or_create),
        )
        .route(
            "/sessions/end",
            post(crate::http::sessions::end_session),
        )
        .route(
            "/sessions/{id}/claude_session",
            post(crate::http::sessions::set_claude_session),
        )
        .route(
            "/sessions/{id}/message",
            post(crate::http::sessions::store_message),
        )
        .route(
            "/sessions/{id}/history",
            get(crate::http::sessions::history),
        )
        .route(
            "/sessions/{id}/last_message_time",
            get(crate::http::sessions::last_message_time),
        )
        .route(
            "/sessions/{id}/generate_name",
            post(crate::http::sessions::generate_name),
        )
        // Agent streaming
        .route("/agent/ws", get(crate::ws::connection::ws_handler))
        // Context cache
        .route("/context/build", post(crate::http::context::build))
        .route("/context/get", post(crate::http::context::get_cached))
        // Presence
        .route(
            "/presence/register",
            post(crate::http::presence::register),
        )
        .route(
            "/presence/heartbeat",
            post(crate::http::presence::heartbeat),
        )
        .route(
            "/presence/unregister",
            post(crate::http::presence::unregister),
        )
        .route(
            "/presence/available",
            get(crate::http::presence::available),
        )
        // Notifications
        .route(
            "/notifications/create",
            post(crate::http::notifications::create),
        )
        .route(
            "/notifications/pending",
            get(crate::http::notifications::pending),
        )
        .route(
            "/notifications/recent_unacknowledged",
            post(crate::http::notifications::recent_unacknowledged),
        )
        .route(
            "/notifications/{id}/delivered",
            post(crate::http::notifications::delivered),
        )
        .route(
            "/notifications/{id}/failed",
            post(crate::http::notifications::failed),
        )
        .route(
            "/notifications/{id}/acknowledge",
            post(crate::http::notifications::acknowledge),
        )
        // Emotion collaborator
        .route(
            "/emotion/summary/{session_id}",
            get(crate::http::emotion::summary),
        )
        .route("/emotion/state", get(crate::http::emotion::state))
        .route("/emotion/history", get(crate::http::emotion::history))
        // Routing collaborator surface
        .route("/routing/decide", post(crate::http::routing::decide))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
