use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::provider::{ChatRequest, LlmProvider, Message, Role};
use crate::stream::StreamEvent;

/// Raw event produced by a session runner, before sequence numbers are
/// assigned by the service.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// Provider session/resume token — emitted once, captured by the service.
    SessionId(String),
    TextDelta(String),
    ThinkingDelta(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Done {
        stop_reason: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Execution backend for one agent session.
///
/// Two strategies: [`LocalRunner`] drives the LLM provider in-process;
/// [`crate::sandbox::SandboxRunner`] drives a containerized worker over
/// line-delimited JSON. The permission gate is a capability handed to the
/// sandbox at construction, not a method on this trait.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Initialise the runner (start container, prime client state).
    async fn start(&mut self) -> Result<()>;

    /// Submit a query. Returns the event stream for this turn, which ends
    /// with `Done` or `Error`.
    async fn query(&mut self, prompt: &str) -> Result<mpsc::Receiver<RunnerEvent>>;

    /// Release resources (stop container, drop connections).
    async fn close(&mut self);

    /// The provider resume token, once known.
    fn claude_session_id(&self) -> Option<String>;
}

/// In-process runner: streams straight from the LLM provider, holding the
/// conversation history so each turn carries full context.
///
/// Local sessions are plain chat — tool execution needs the sandbox worker,
/// so no tools are offered to the provider here.
pub struct LocalRunner {
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: String,
    thinking_budget: Option<u32>,
    history: Arc<Mutex<Vec<Message>>>,
    session_token: Option<String>,
    announced_token: bool,
}

impl LocalRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: String,
        system_prompt: String,
        thinking_budget: Option<u32>,
        resume_token: Option<String>,
    ) -> Self {
        Self {
            provider,
            model,
            system_prompt,
            thinking_budget,
            history: Arc::new(Mutex::new(Vec::new())),
            session_token: resume_token,
            announced_token: false,
        }
    }
}

#[async_trait]
impl SessionRunner for LocalRunner {
    async fn start(&mut self) -> Result<()> {
        // The raw messages API has no server-side sessions; the token is
        // minted locally and only identifies this runner for resume purposes.
        if self.session_token.is_none() {
            self.session_token = Some(Uuid::new_v4().to_string());
        }
        Ok(())
    }

    async fn query(&mut self, prompt: &str) -> Result<mpsc::Receiver<RunnerEvent>> {
        let (tx, rx) = mpsc::channel(64);

        {
            let mut history = self.history.lock().unwrap();
            history.push(Message {
                role: Role::User,
                content: prompt.to_string(),
            });
        }

        if !self.announced_token {
            self.announced_token = true;
            if let Some(token) = &self.session_token {
                let _ = tx.send(RunnerEvent::SessionId(token.clone())).await;
            }
        }

        let req = ChatRequest {
            model: self.model.clone(),
            system: self.system_prompt.clone(),
            messages: self.history.lock().unwrap().clone(),
            max_tokens: 4096,
            stream: true,
            thinking_budget: self.thinking_budget,
        };

        let provider = self.provider.clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(64);

            let send_task = {
                let provider = provider.clone();
                tokio::spawn(async move { provider.send_stream(&req, stream_tx).await })
            };

            let mut response = String::new();
            while let Some(event) = stream_rx.recv().await {
                let forwarded = match event {
                    StreamEvent::TextDelta { text } => {
                        response.push_str(&text);
                        RunnerEvent::TextDelta(text)
                    }
                    StreamEvent::Thinking { text } => RunnerEvent::ThinkingDelta(text),
                    StreamEvent::ToolUse { id, name, input } => {
                        RunnerEvent::ToolUse { id, name, input }
                    }
                    StreamEvent::Done { stop_reason, .. } => {
                        if !response.is_empty() {
                            history.lock().unwrap().push(Message {
                                role: Role::Assistant,
                                content: std::mem::take(&mut response),
                            });
                        }
                        let _ = tx.send(RunnerEvent::Done { stop_reason }).await;
                        break;
                    }
                    StreamEvent::Error { message } => {
                        let _ = tx
                            .send(RunnerEvent::Error {
                                message,
                                recoverable: true,
                            })
                            .await;
                        break;
                    }
                };
                if tx.send(forwarded).await.is_err() {
                    break; // consumer gone, stop streaming
                }
            }

            match send_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "provider stream failed");
                    let _ = tx
                        .send(RunnerEvent::Error {
                            message: e.to_string(),
                            recoverable: true,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, "provider stream task panicked");
                }
            }
        });

        Ok(rx)
    }

    async fn close(&mut self) {
        // Nothing to release — provider client is shared.
    }

    fn claude_session_id(&self) -> Option<String> {
        self.session_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ProviderError};

    struct ScriptedProvider;

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: format!("echo: {}", req.messages.last().unwrap().content),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn local_runner_streams_and_records_history() {
        let mut runner = LocalRunner::new(
            Arc::new(ScriptedProvider),
            "test-model".into(),
            "system".into(),
            None,
            None,
        );
        runner.start().await.unwrap();
        assert!(runner.claude_session_id().is_some());

        let mut rx = runner.query("hello").await.unwrap();
        let mut saw_token = false;
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                RunnerEvent::SessionId(_) => saw_token = true,
                RunnerEvent::TextDelta(t) => text.push_str(&t),
                RunnerEvent::Done { .. } => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_token);
        assert_eq!(text, "echo: hello");

        // Second turn sees the first exchange in history.
        let mut rx = runner.query("again").await.unwrap();
        while let Some(event) = rx.recv().await {
            if matches!(event, RunnerEvent::Done { .. }) {
                break;
            }
        }
        let history = runner.history.lock().unwrap();
        assert_eq!(history.len(), 4); // user, assistant, user, assistant
    }
}
