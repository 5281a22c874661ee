use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use dere_core::config::{SandboxConfig, SANDBOX_READY_TIMEOUT_SECS};

use crate::error::{AgentError, Result};
use crate::permission::{PermissionBroker, PermissionDecision};
use crate::runner::{RunnerEvent, SessionRunner};

/// Line from the container worker.
/// Mirrors the worker entrypoint protocol exactly.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerLine {
    Ready,
    SessionId {
        session_id: String,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
    },
    Done {
        #[serde(default)]
        stop_reason: String,
    },
    Error {
        message: String,
    },
}

/// Line to the container worker.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostLine<'a> {
    Query {
        prompt: &'a str,
    },
    PermissionResponse {
        request_id: &'a str,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        deny_message: Option<&'a str>,
    },
    Close,
}

/// Build-time parameters for one sandboxed session.
pub struct SandboxParams {
    pub working_dir: String,
    pub system_prompt: String,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub resume_session_id: Option<String>,
}

/// Session runner backed by a containerized worker with restricted mounts
/// and resource caps, speaking line-delimited JSON over stdio.
///
/// Permission requests from the worker are routed through the
/// [`PermissionBroker`] capability and the decision is written back, so the
/// worker blocks on exactly the same 300 s gate as local tooling would.
pub struct SandboxRunner {
    sandbox: SandboxConfig,
    params: SandboxParams,
    broker: Arc<PermissionBroker>,

    child: Option<Child>,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    session_id: Arc<Mutex<Option<String>>>,
    /// Sink for the currently streaming query, installed by `query()`.
    current_query: Arc<Mutex<Option<mpsc::Sender<RunnerEvent>>>>,
}

impl SandboxRunner {
    pub fn new(sandbox: SandboxConfig, params: SandboxParams, broker: Arc<PermissionBroker>) -> Self {
        let session_id = Arc::new(Mutex::new(params.resume_session_id.clone()));
        Self {
            sandbox,
            params,
            broker,
            child: None,
            stdin: None,
            session_id,
            current_query: Arc::new(Mutex::new(None)),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("-i")
            .arg("--rm")
            .arg("--network")
            .arg("bridge")
            .arg("--memory")
            .arg(&self.sandbox.memory_limit)
            .arg("--cpus")
            .arg(self.sandbox.cpu_limit.to_string());

        if !self.params.working_dir.is_empty() {
            cmd.arg("-v")
                .arg(format!("{}:/workspace:rw", self.params.working_dir))
                .arg("-w")
                .arg("/workspace");
        }

        cmd.arg("-e")
            .arg(format!("SANDBOX_SYSTEM_PROMPT={}", self.params.system_prompt));
        if let Some(model) = &self.params.model {
            cmd.arg("-e").arg(format!("SANDBOX_MODEL={model}"));
        }
        if let Some(tools) = &self.params.allowed_tools {
            cmd.arg("-e")
                .arg(format!("SANDBOX_ALLOWED_TOOLS={}", tools.join(",")));
        }
        if let Some(resume) = &self.params.resume_session_id {
            cmd.arg("-e").arg(format!("SANDBOX_RESUME_SESSION_ID={resume}"));
        }

        cmd.arg(&self.sandbox.image);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn write_line(stdin: &Arc<tokio::sync::Mutex<ChildStdin>>, line: &HostLine<'_>) -> Result<()> {
        let mut json = serde_json::to_string(line)
            .map_err(|e| AgentError::Runner(format!("encode host line: {e}")))?;
        json.push('\n');
        let mut guard = stdin.lock().await;
        guard.write_all(json.as_bytes()).await?;
        guard.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRunner for SandboxRunner {
    async fn start(&mut self) -> Result<()> {
        let mut child = self
            .build_command()
            .spawn()
            .map_err(|e| AgentError::SandboxStart(format!("spawn container: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SandboxStart("no stdout pipe".to_string()))?;
        let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take().ok_or_else(
            || AgentError::SandboxStart("no stdin pipe".to_string()),
        )?));

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let reader_stdin = stdin.clone();
        let session_id = self.session_id.clone();
        let current_query = self.current_query.clone();
        let broker = self.broker.clone();

        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let parsed: WorkerLine = match serde_json::from_str(line) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, line, "unparseable worker line, skipping");
                        continue;
                    }
                };
                route_worker_line(
                    parsed,
                    &mut ready_tx,
                    &session_id,
                    &current_query,
                    &broker,
                    &reader_stdin,
                )
                .await;
            }
            debug!("sandbox stdout closed");
            // Worker gone mid-query: surface a recoverable error to the stream.
            let sink = current_query.lock().unwrap().take();
            if let Some(sink) = sink {
                let _ = sink
                    .send(RunnerEvent::Error {
                        message: "sandbox worker exited".to_string(),
                        recoverable: true,
                    })
                    .await;
            }
        });

        match tokio::time::timeout(Duration::from_secs(SANDBOX_READY_TIMEOUT_SECS), ready_rx).await
        {
            Ok(Ok(())) => {
                info!("sandbox container ready");
            }
            _ => {
                let _ = child.kill().await;
                return Err(AgentError::SandboxStart(
                    "container did not become ready in time".to_string(),
                ));
            }
        }

        self.child = Some(child);
        self.stdin = Some(stdin);
        Ok(())
    }

    async fn query(&mut self, prompt: &str) -> Result<mpsc::Receiver<RunnerEvent>> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or_else(|| AgentError::Runner("sandbox not started".to_string()))?
            .clone();

        let (tx, rx) = mpsc::channel(64);
        *self.current_query.lock().unwrap() = Some(tx);

        Self::write_line(&stdin, &HostLine::Query { prompt }).await?;
        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some(stdin) = &self.stdin {
            let _ = Self::write_line(stdin, &HostLine::Close).await;
        }
        if let Some(mut child) = self.child.take() {
            // Give the worker a moment to exit cleanly, then force it.
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("sandbox container did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.stdin = None;
    }

    fn claude_session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }
}

/// Dispatch one parsed worker line: capture init state, answer permission
/// requests through the broker, forward stream events to the active query.
async fn route_worker_line(
    line: WorkerLine,
    ready_tx: &mut Option<oneshot::Sender<()>>,
    session_id: &Arc<Mutex<Option<String>>>,
    current_query: &Arc<Mutex<Option<mpsc::Sender<RunnerEvent>>>>,
    broker: &Arc<PermissionBroker>,
    stdin: &Arc<tokio::sync::Mutex<ChildStdin>>,
) {
    let forward = |event: RunnerEvent, end_of_turn: bool| {
        let sink = if end_of_turn {
            current_query.lock().unwrap().take()
        } else {
            current_query.lock().unwrap().clone()
        };
        async move {
            if let Some(sink) = sink {
                let _ = sink.send(event).await;
            }
        }
    };

    match line {
        WorkerLine::Ready => {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
        WorkerLine::SessionId { session_id: sid } => {
            // Captured once — the worker may repeat it on resume.
            {
                let mut guard = session_id.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(sid.clone());
                }
            }
            forward(RunnerEvent::SessionId(sid), false).await;
        }
        WorkerLine::Text { text } => forward(RunnerEvent::TextDelta(text), false).await,
        WorkerLine::Thinking { text } => forward(RunnerEvent::ThinkingDelta(text), false).await,
        WorkerLine::ToolUse { id, name, input } => {
            forward(RunnerEvent::ToolUse { id, name, input }, false).await
        }
        WorkerLine::ToolResult {
            tool_use_id,
            name,
            output,
            is_error,
        } => {
            forward(
                RunnerEvent::ToolResult {
                    tool_use_id,
                    name,
                    output,
                    is_error,
                },
                false,
            )
            .await
        }
        WorkerLine::PermissionRequest {
            request_id,
            tool_name,
            tool_input,
        } => {
            // The broker parks until the client resolves (or 300 s passes);
            // answer on a separate task so streaming is never blocked.
            let broker = broker.clone();
            let stdin = stdin.clone();
            tokio::spawn(async move {
                let decision = broker.can_use_tool(&tool_name, tool_input).await;
                let (allowed, deny_message) = match &decision {
                    PermissionDecision::Allow => (true, None),
                    PermissionDecision::Deny { message } => (false, Some(message.as_str())),
                };
                let line = HostLine::PermissionResponse {
                    request_id: &request_id,
                    allowed,
                    deny_message,
                };
                if let Err(e) = SandboxRunner::write_line(&stdin, &line).await {
                    warn!(error = %e, "failed to write permission response to sandbox");
                }
            });
        }
        WorkerLine::Done { stop_reason } => forward(RunnerEvent::Done { stop_reason }, true).await,
        WorkerLine::Error { message } => {
            forward(
                RunnerEvent::Error {
                    message,
                    recoverable: true,
                },
                true,
            )
            .await
        }
    }
}
