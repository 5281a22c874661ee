use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use dere_agent::{AgentEventBody, AgentService, SessionConfig};

/// Executes one autonomous LLM mission and returns its final text.
///
/// Missions run sandboxed with auto-approve — nobody is around to answer
/// permission prompts.
#[async_trait]
pub trait MissionRunner: Send + Sync {
    async fn run(&self, working_dir: &str, prompt: &str) -> Result<String, String>;
}

/// Mission runner backed by the centralized agent service.
pub struct AgentMissionRunner {
    agent: Arc<AgentService>,
    personality: String,
    model: String,
    allowed_tools: Option<Vec<String>>,
    user_id: Option<String>,
}

impl AgentMissionRunner {
    pub fn new(
        agent: Arc<AgentService>,
        personality: String,
        model: String,
        allowed_tools: Option<Vec<String>>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            agent,
            personality,
            model,
            allowed_tools,
            user_id,
        }
    }
}

#[async_trait]
impl MissionRunner for AgentMissionRunner {
    async fn run(&self, working_dir: &str, prompt: &str) -> Result<String, String> {
        let session = self
            .agent
            .create_session(SessionConfig {
                working_dir: working_dir.to_string(),
                personality: self.personality.clone(),
                user_id: self.user_id.clone(),
                model: Some(self.model.clone()),
                allowed_tools: self.allowed_tools.clone(),
                include_context: false,
                sandbox_mode: true,
                auto_approve: true,
                ..Default::default()
            })
            .await
            .map_err(|e| e.to_string())?;
        let session_id = session.session_id;

        let mut rx = self.agent.query(session, prompt.to_string()).await;
        let mut outcome: Result<String, String> = Err("mission produced no output".to_string());
        while let Some(event) = rx.recv().await {
            match event.body {
                AgentEventBody::Done { response_text, .. } => {
                    outcome = Ok(response_text);
                    break;
                }
                AgentEventBody::Error { message, .. } => {
                    outcome = Err(message);
                    break;
                }
                AgentEventBody::Cancelled { .. } => {
                    outcome = Err("mission cancelled".to_string());
                    break;
                }
                _ => {}
            }
        }

        self.agent.close_session(session_id).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "mission did not complete");
        }
        outcome
    }
}
