use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use dere_agent::personality::PersonalityLoader;
use dere_agent::provider::{ChatRequest, LlmProvider};
use dere_agent::service::EmotionSource;
use dere_core::config::AmbientConfig;
use dere_core::types::Priority;
use dere_curiosity::explorer::parse_mission_output;
use dere_sessions::SessionStore;

use crate::activity::ActivitySnapshot;
use crate::fsm::TaskData;
use crate::routing::MessageRouter;

/// Task-system collaborator feeding the task signal and engagement context.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn task_context(&self) -> TaskData;
}

/// Retrieval collaborator (hybrid search with diversity reranking lives
/// behind this seam).
#[async_trait]
pub trait ContextSearch: Send + Sync {
    /// Short summary of recent conversation context.
    async fn previous_context(&self, user_id: &str, since_minutes: u64) -> Option<String>;

    /// Recent entities/topics the user worked with.
    async fn entity_context(&self, user_id: &str, limit: usize) -> Option<String>;
}

/// The outcome of one engagement check.
#[derive(Debug, Clone)]
pub struct EngagementDecision {
    pub should_engage: bool,
    pub message: Option<String>,
    pub priority: Priority,
    pub target_medium: Option<String>,
    pub target_location: Option<String>,
    pub routing_reasoning: Option<String>,
    pub context_snapshot: Value,
}

impl EngagementDecision {
    fn declined() -> Self {
        Self {
            should_engage: false,
            message: None,
            priority: Priority::Alert,
            target_medium: None,
            target_location: None,
            routing_reasoning: None,
            context_snapshot: Value::Null,
        }
    }
}

/// Structured answer expected from the engagement LLM call.
#[derive(Debug, Deserialize)]
struct EngagementLlmAnswer {
    #[serde(default)]
    should_engage: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    reasoning: String,
}

fn default_priority() -> String {
    "conversation".to_string()
}

/// Analyzes user context and decides when to proactively engage.
///
/// The gates (activity present, idle threshold) are deterministic; only
/// past them does an LLM get a vote. Every failure path answers "don't".
pub struct ContextAnalyzer {
    config: AmbientConfig,
    store: Arc<SessionStore>,
    provider: Arc<dyn LlmProvider>,
    personalities: Arc<PersonalityLoader>,
    router: Arc<MessageRouter>,
    emotion: Option<Arc<dyn EmotionSource>>,
    tasks: Option<Arc<dyn TaskSource>>,
    search: Option<Arc<dyn ContextSearch>>,
    model: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ContextAnalyzer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AmbientConfig,
        store: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        personalities: Arc<PersonalityLoader>,
        router: Arc<MessageRouter>,
        emotion: Option<Arc<dyn EmotionSource>>,
        tasks: Option<Arc<dyn TaskSource>>,
        search: Option<Arc<dyn ContextSearch>>,
        model: String,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            personalities,
            router,
            emotion,
            tasks,
            search,
            model,
        }
    }

    /// Minutes since the user last talked to us, if ever.
    pub fn minutes_idle(&self) -> Option<f64> {
        match self.store.last_interaction_time(&self.config.user_id) {
            Ok(Some(last)) => Some((now_unix() - last).max(0) as f64 / 60.0),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "failed to read last interaction time");
                None
            }
        }
    }

    /// Decide whether to reach out, and where.
    ///
    /// Steps: activity gate, idle gate, context gathering, engagement LLM,
    /// then routing over reachable presence.
    pub async fn should_engage(&self, activity: Option<&ActivitySnapshot>) -> EngagementDecision {
        let Some(activity) = activity else {
            info!("no current activity detected, skipping engagement check");
            return EngagementDecision::declined();
        };

        let minutes_idle = self.minutes_idle();
        if let Some(idle) = minutes_idle {
            if idle < self.config.idle_threshold_minutes as f64 {
                info!(
                    minutes_idle = idle,
                    threshold = self.config.idle_threshold_minutes,
                    "user recently active, skipping engagement"
                );
                return EngagementDecision::declined();
            }
        } else {
            info!("no previous interactions found (cold start)");
        }

        let previous_context = match &self.search {
            Some(search) => search.previous_context(&self.config.user_id, 30).await,
            None => None,
        };
        let entity_context = match &self.search {
            Some(search) => search.entity_context(&self.config.user_id, 5).await,
            None => None,
        };
        let emotion_summary = match &self.emotion {
            Some(emotion) => emotion.summary(None).await,
            None => None,
        };
        let task_context = match &self.tasks {
            Some(tasks) => tasks.task_context().await,
            None => TaskData::default(),
        };

        let snapshot = json!({
            "activity": {
                "app": activity.app,
                "title": activity.title,
                "duration": activity.duration_seconds,
                "duration_window_seconds": activity.window_seconds,
            },
            "minutes_idle": minutes_idle,
            "previous_context": previous_context,
            "entity_context": entity_context,
            "emotion": emotion_summary,
            "tasks": {
                "overdue_count": task_context.overdue_count,
                "due_soon_count": task_context.due_soon_count,
            },
        });

        let Some(answer) = self.evaluate_engagement(&snapshot).await else {
            return EngagementDecision::declined();
        };
        if !answer.should_engage {
            info!(reasoning = %answer.reasoning, "ambient decision: no engagement");
            return EngagementDecision::declined();
        }
        let Some(message) = answer.message.filter(|m| !m.trim().is_empty()) else {
            info!("engagement affirmed without a message, declining");
            return EngagementDecision::declined();
        };
        let priority: Priority = answer
            .priority
            .parse()
            .unwrap_or(Priority::Conversation);

        info!(%priority, %message, "ambient decision: engage");

        let activity_json = snapshot["activity"].clone();
        let routing = self
            .router
            .decide(&self.config.user_id, &message, priority, &activity_json)
            .await;
        let Some(routing) = routing else {
            info!("routing produced no reachable destination, declining");
            return EngagementDecision::declined();
        };

        EngagementDecision {
            should_engage: true,
            message: Some(message),
            priority,
            target_medium: Some(routing.medium),
            target_location: Some(routing.location),
            routing_reasoning: Some(routing.reasoning),
            context_snapshot: snapshot,
        }
    }

    /// The engagement LLM call. Unparseable output means "don't engage".
    async fn evaluate_engagement(&self, snapshot: &Value) -> Option<EngagementLlmAnswer> {
        let system = self.personalities.build_prompt(&self.config.personality);
        let prompt = format!(
            "Current context:\n{snapshot}\n\n\
             If there are overdue tasks, upcoming deadlines, or relevant context worth \
             mentioning, engage. Otherwise don't.\n\n\
             Respond with a JSON object: {{\"should_engage\": bool, \
             \"priority\": \"alert\"|\"conversation\", \"message\": \"...\", \
             \"reasoning\": \"...\"}}"
        );

        let req = ChatRequest::new(self.model.clone(), system, prompt);
        let raw = match self.provider.send(&req).await {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(error = %e, "engagement LLM call failed");
                return None;
            }
        };

        let value = parse_mission_output(&raw)?;
        serde_json::from_value(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dere_agent::provider::{ChatResponse, ProviderError};
    use dere_core::types::MessageRole;
    use dere_presence::types::ChannelInfo;
    use dere_presence::PresenceRegistry;
    use rusqlite::Connection;

    struct ScriptedProvider {
        answer: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.answer.clone(),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    fn session_store() -> Arc<SessionStore> {
        let conn = Connection::open_in_memory().unwrap();
        dere_sessions::db::init_db(&conn).unwrap();
        Arc::new(SessionStore::new(conn))
    }

    fn presence_with_discord() -> Arc<PresenceRegistry> {
        let conn = Connection::open_in_memory().unwrap();
        dere_presence::db::init_db(&conn).unwrap();
        let registry = PresenceRegistry::new(conn);
        registry
            .register(
                "discord",
                "default_user",
                &[ChannelInfo {
                    id: "123".to_string(),
                    name: None,
                    channel_type: Some("dm".to_string()),
                    extra: Default::default(),
                }],
            )
            .unwrap();
        Arc::new(registry)
    }

    fn analyzer(answer: &str, store: Arc<SessionStore>) -> ContextAnalyzer {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            answer: answer.to_string(),
        });
        let router = Arc::new(MessageRouter::new(
            presence_with_discord(),
            provider.clone(),
            "test-model".to_string(),
        ));
        ContextAnalyzer::new(
            AmbientConfig::default(),
            store,
            provider,
            Arc::new(PersonalityLoader::with_dir("/nonexistent")),
            router,
            None,
            None,
            None,
            "test-model".to_string(),
        )
    }

    fn activity() -> ActivitySnapshot {
        ActivitySnapshot {
            app: "firefox".to_string(),
            title: "reading".to_string(),
            duration_seconds: 600.0,
            window_seconds: 600.0,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn no_activity_never_engages() {
        let analyzer = analyzer("{\"should_engage\": true}", session_store());
        let decision = analyzer.should_engage(None).await;
        assert!(!decision.should_engage);
    }

    #[tokio::test]
    async fn recent_interaction_blocks_engagement() {
        let store = session_store();
        let session = store
            .create(&dere_sessions::types::NewSession {
                working_dir: "/tmp".into(),
                medium: "cli".into(),
                user_id: Some("default_user".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .append_conversation(
                session,
                "hi",
                MessageRole::User,
                now_unix(), // just now — well inside the idle threshold
                None,
                Some("default_user"),
                None,
                &[],
            )
            .unwrap();

        let analyzer = analyzer(
            "{\"should_engage\": true, \"message\": \"hey\", \"priority\": \"alert\"}",
            store,
        );
        let decision = analyzer.should_engage(Some(&activity())).await;
        assert!(!decision.should_engage);
    }

    #[tokio::test]
    async fn affirmative_decision_routes_to_reachable_medium() {
        // The scripted provider answers both the engagement and routing calls;
        // the object parses either way because the router only reads
        // medium/location and the analyzer only reads its own fields.
        let answer = "{\"should_engage\": true, \"message\": \"You have 3 overdue tasks.\", \
                      \"priority\": \"alert\", \"medium\": \"discord\", \"location\": \"123\", \
                      \"reasoning\": \"direct ping\"}";
        let analyzer = analyzer(answer, session_store());

        let decision = analyzer.should_engage(Some(&activity())).await;
        assert!(decision.should_engage);
        assert_eq!(decision.message.as_deref(), Some("You have 3 overdue tasks."));
        assert_eq!(decision.priority, Priority::Alert);
        assert_eq!(decision.target_medium.as_deref(), Some("discord"));
        assert_eq!(decision.target_location.as_deref(), Some("123"));
        assert_eq!(decision.context_snapshot["activity"]["app"], "firefox");
    }

    #[tokio::test]
    async fn freeform_llm_output_is_conservative_no() {
        let analyzer = analyzer(
            "Sure! I think reaching out now would be lovely.",
            session_store(),
        );
        let decision = analyzer.should_engage(Some(&activity())).await;
        assert!(!decision.should_engage);
    }
}
