use std::net::SocketAddr;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{info, warn};

use dere_agent::anthropic::AnthropicProvider;
use dere_agent::personality::PersonalityLoader;
use dere_agent::provider::LlmProvider;
use dere_agent::AgentService;
use dere_ambient::activity::ActivityWatchClient;
use dere_ambient::analyzer::ContextAnalyzer;
use dere_ambient::{AmbientMonitor, MessageRouter};
use dere_core::config::DereConfig;
use dere_curiosity::mission::AgentMissionRunner;
use dere_curiosity::triggers::TriggerCollector;
use dere_curiosity::{CuriosityStore, Explorer};
use dere_notify::NotificationQueue;
use dere_presence::PresenceRegistry;
use dere_sessions::SessionStore;

mod app;
mod http;
mod ws;

const EXPLORATION_TOOLS: &[&str] = &["Read", "WebSearch", "WebFetch"];
const ACTIVITYWATCH_URL: &str = "http://localhost:5600";

fn open_db(path: &str) -> anyhow::Result<Connection> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Connection::open(path)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dere_gateway=info,dere_ambient=info,tower_http=debug".into()),
        )
        .init();

    // Config: explicit DERE_CONFIG path > ~/.config/dere/config.toml.
    // Parse or validation failures are fatal — never limp along misconfigured.
    let config_path = std::env::var("DERE_CONFIG").ok();
    let config = DereConfig::load(config_path.as_deref())?;

    // One SQLite file, one connection per subsystem store.
    let db_path = &config.database.path;
    let sessions_conn = open_db(db_path)?;
    dere_sessions::db::init_db(&sessions_conn)?;
    let sessions = Arc::new(SessionStore::new(sessions_conn));

    let presence_conn = open_db(db_path)?;
    dere_presence::db::init_db(&presence_conn)?;
    let presence = Arc::new(PresenceRegistry::new(presence_conn));

    let notify_conn = open_db(db_path)?;
    dere_notify::db::init_db(&notify_conn)?;
    let notifications = Arc::new(NotificationQueue::new(notify_conn));

    let curiosity_conn = open_db(db_path)?;
    dere_curiosity::db::init_db(&curiosity_conn)?;
    let curiosity = Arc::new(CuriosityStore::new(curiosity_conn));
    // Attempts interrupted by a crash sit in in_progress; give them back to
    // the claim cycle after a grace period.
    if let Err(e) = curiosity.reset_stalled(2) {
        warn!(error = %e, "failed to reset stalled curiosity tasks");
    }

    // LLM provider. A missing key degrades every LLM-backed feature to
    // logged failures, which the loops treat as transient.
    let (api_key, base_url) = match &config.providers.anthropic {
        Some(anthropic) => (anthropic.api_key.clone(), Some(anthropic.base_url.clone())),
        None => {
            let key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
            if key.is_empty() {
                warn!("no Anthropic credentials configured; LLM calls will fail");
            }
            (key, None)
        }
    };
    let provider: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(api_key, base_url));

    let personalities = Arc::new(PersonalityLoader::new());
    let agent = Arc::new(AgentService::new(
        sessions.clone(),
        provider.clone(),
        personalities.clone(),
        None,
        config.sandbox.clone(),
        config.context.clone(),
        config.agent.model.clone(),
    ));
    let cleanup_task = agent.spawn_idle_cleanup();

    let router = Arc::new(MessageRouter::new(
        presence.clone(),
        provider.clone(),
        config.agent.model.clone(),
    ));
    let collector = TriggerCollector::new(curiosity.clone());

    // Ambient stack: explorer missions get the restricted tool set; the
    // engagement mission runs tool-less.
    let exploration_missions = Arc::new(AgentMissionRunner::new(
        agent.clone(),
        config.ambient.personality.clone(),
        config.agent.mission_model.clone(),
        Some(EXPLORATION_TOOLS.iter().map(|t| t.to_string()).collect()),
        Some(config.ambient.user_id.clone()),
    ));
    let explorer = Arc::new(Explorer::new(
        curiosity.clone(),
        exploration_missions,
        None,
        config.ambient.user_id.clone(),
    ));
    let ambient_missions = Arc::new(AgentMissionRunner::new(
        agent.clone(),
        config.ambient.personality.clone(),
        config.agent.mission_model.clone(),
        None,
        Some(config.ambient.user_id.clone()),
    ));

    let analyzer = ContextAnalyzer::new(
        config.ambient.clone(),
        sessions.clone(),
        provider.clone(),
        personalities.clone(),
        router.clone(),
        None,
        None,
        None,
        config.agent.model.clone(),
    );
    let activity = Arc::new(ActivityWatchClient::new(ACTIVITYWATCH_URL));
    let monitor = AmbientMonitor::new(
        config.ambient.clone(),
        analyzer,
        activity,
        ambient_missions,
        notifications.clone(),
        Some(explorer),
        None,
        None,
        None,
    );
    let ambient_handle = monitor.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    // Periodic stale-presence sweep so dead adapters drop out of routing.
    let sweep_presence = presence.clone();
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = sweep_presence.sweep_stale(dere_core::config::PRESENCE_STALE_SECS) {
                        warn!(error = %e, "presence sweep failed");
                    }
                }
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let state = Arc::new(app::AppState {
        config: config.clone(),
        sessions,
        presence,
        notifications,
        curiosity,
        collector,
        agent: agent.clone(),
        router,
        emotion: None,
        search: None,
        ambient: ambient_handle,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!(%addr, daemon_url = %config.daemon.url, "dere gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Orderly teardown: stop the loops, close every agent session (sandbox
    // sessions get locked in the database on the way out).
    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    let _ = sweep_task.await;
    cleanup_task.abort();
    agent.close_all().await;

    Ok(())
}
