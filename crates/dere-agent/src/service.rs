use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dere_core::config::{
    ContextConfig, SandboxConfig, EVENT_BUFFER_SIZE, SANDBOX_CLEANUP_INTERVAL_SECS,
    SANDBOX_IDLE_TIMEOUT_SECS,
};
use dere_core::types::MessageRole;
use dere_sessions::types::{ConversationMetrics, NewSession};
use dere_sessions::SessionStore;

use crate::blocks::BlockAssembler;
use crate::error::{AgentError, Result};
use crate::events::{cancelled_event, error_event, AgentEvent, AgentEventBody, Timings};
use crate::permission::{PermissionBroker, PermissionRequest};
use crate::personality::{time_context, PersonalityLoader};
use crate::provider::{ChatRequest, LlmProvider};
use crate::runner::{LocalRunner, RunnerEvent, SessionRunner};
use crate::sandbox::{SandboxParams, SandboxRunner};

/// Emotional state collaborator — summaries get injected into system prompts
/// and surfaced over HTTP. The daemon runs fine without one.
#[async_trait]
pub trait EmotionSource: Send + Sync {
    async fn summary(&self, session_id: Option<i64>) -> Option<String>;

    async fn state(&self) -> serde_json::Value {
        serde_json::json!({ "emotion_type": "neutral", "intensity": 0 })
    }
}

/// Configuration for an agent session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub working_dir: String,
    pub personality: String,
    pub user_id: Option<String>,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub include_context: bool,
    pub sandbox_mode: bool,
    /// Autonomous sessions (missions, exploration) skip permission prompts.
    pub auto_approve: bool,
    pub session_name: Option<String>,
    pub mission_id: Option<i64>,
    pub thinking_budget: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            working_dir: String::new(),
            personality: String::new(),
            user_id: None,
            model: None,
            allowed_tools: None,
            include_context: true,
            sandbox_mode: false,
            auto_approve: false,
            session_name: None,
            mission_id: None,
            thinking_budget: None,
        }
    }
}

const QUERY_MEDIUM: &str = "agent_api";

/// Bounded ring of recent events with the session's monotonic sequence.
struct EventRing {
    seq: u64,
    buffer: VecDeque<AgentEvent>,
}

impl EventRing {
    fn new() -> Self {
        Self {
            seq: 0,
            buffer: VecDeque::with_capacity(EVENT_BUFFER_SIZE),
        }
    }

    fn add(&mut self, mut event: AgentEvent) -> AgentEvent {
        self.seq += 1;
        event.seq = Some(self.seq);
        if self.buffer.len() == EVENT_BUFFER_SIZE {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event.clone());
        event
    }

    fn events_since(&self, last_seq: u64) -> Vec<AgentEvent> {
        self.buffer
            .iter()
            .filter(|e| e.seq.is_some_and(|s| s > last_seq))
            .cloned()
            .collect()
    }
}

/// One active agent session: runner, event ring, permission broker, clocks.
pub struct AgentSession {
    pub session_id: i64,
    pub config: SessionConfig,
    pub name: Mutex<Option<String>>,
    pub is_locked: bool,

    runner: tokio::sync::Mutex<Option<Box<dyn SessionRunner>>>,
    broker: Arc<PermissionBroker>,
    permission_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PermissionRequest>>,
    ring: Mutex<EventRing>,
    cancel: Mutex<CancellationToken>,
    last_activity: Mutex<Instant>,
    needs_token_capture: AtomicBool,
    initial_prompt: Mutex<Option<String>>,
    first_response: Mutex<Option<String>>,
}

impl AgentSession {
    fn new(
        session_id: i64,
        config: SessionConfig,
        is_locked: bool,
        needs_token_capture: bool,
    ) -> Self {
        let (broker, permission_rx) = PermissionBroker::new(config.auto_approve);
        Self {
            session_id,
            name: Mutex::new(config.session_name.clone()),
            is_locked,
            runner: tokio::sync::Mutex::new(None),
            broker: Arc::new(broker),
            permission_rx: tokio::sync::Mutex::new(permission_rx),
            ring: Mutex::new(EventRing::new()),
            cancel: Mutex::new(CancellationToken::new()),
            last_activity: Mutex::new(Instant::now()),
            needs_token_capture: AtomicBool::new(needs_token_capture),
            initial_prompt: Mutex::new(None),
            first_response: Mutex::new(None),
            config,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn add_event(&self, event: AgentEvent) -> AgentEvent {
        self.ring.lock().unwrap().add(event)
    }

    pub fn broker(&self) -> Arc<PermissionBroker> {
        self.broker.clone()
    }
}

/// Central multiplexer for all LLM sessions in the daemon.
///
/// Sessions are independent and may stream in parallel; all mutation of one
/// session goes through its own locks, never a global one.
pub struct AgentService {
    store: Arc<SessionStore>,
    provider: Arc<dyn LlmProvider>,
    personalities: Arc<PersonalityLoader>,
    emotion: Option<Arc<dyn EmotionSource>>,
    sandbox: SandboxConfig,
    context: ContextConfig,
    default_model: String,
    sessions: DashMap<i64, Arc<AgentSession>>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl AgentService {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        personalities: Arc<PersonalityLoader>,
        emotion: Option<Arc<dyn EmotionSource>>,
        sandbox: SandboxConfig,
        context: ContextConfig,
        default_model: String,
    ) -> Self {
        Self {
            store,
            provider,
            personalities,
            emotion,
            sandbox,
            context,
            default_model,
            sessions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    async fn build_system_prompt(&self, config: &SessionConfig) -> String {
        let mut prompt = self.personalities.build_prompt(&config.personality);
        if config.include_context {
            if self.context.time {
                prompt.push_str(&time_context());
            }
            if let Some(emotion) = &self.emotion {
                if let Some(summary) = emotion.summary(None).await {
                    prompt.push_str("\n\n## Emotional State\n");
                    prompt.push_str(&summary);
                }
            }
        }
        prompt
    }

    async fn build_runner(
        &self,
        config: &SessionConfig,
        broker: Arc<PermissionBroker>,
        resume_token: Option<String>,
    ) -> Result<Box<dyn SessionRunner>> {
        let system_prompt = self.build_system_prompt(config).await;
        let mut runner: Box<dyn SessionRunner> = if config.sandbox_mode {
            Box::new(SandboxRunner::new(
                self.sandbox.clone(),
                SandboxParams {
                    working_dir: config.working_dir.clone(),
                    system_prompt,
                    model: config.model.clone(),
                    allowed_tools: config.allowed_tools.clone(),
                    resume_session_id: resume_token,
                },
                broker,
            ))
        } else {
            Box::new(LocalRunner::new(
                self.provider.clone(),
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model.clone()),
                system_prompt,
                config.thinking_budget,
                resume_token,
            ))
        };
        runner.start().await?;
        Ok(runner)
    }

    /// Create a new session: a database row plus a live runner.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Arc<AgentSession>> {
        let session_id = self.store.create(&NewSession {
            working_dir: config.working_dir.clone(),
            medium: QUERY_MEDIUM.to_string(),
            user_id: config.user_id.clone(),
            personality: Some(config.personality.clone()),
            name: config.session_name.clone(),
            sandbox_mode: config.sandbox_mode,
            mission_id: config.mission_id,
            continued_from: None,
        })?;

        // The session is built first so the broker can be handed to the runner.
        let session = Arc::new(AgentSession::new(session_id, config.clone(), false, true));
        let runner = self
            .build_runner(&config, session.broker(), None)
            .await?;
        *session.runner.lock().await = Some(runner);

        self.sessions.insert(session_id, session.clone());
        info!(
            session_id,
            sandbox = config.sandbox_mode,
            personality = %config.personality,
            "agent session created"
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: i64) -> Option<Arc<AgentSession>> {
        self.sessions.get(&session_id).map(|s| s.value().clone())
    }

    /// Resume an existing session from the database without creating a row.
    ///
    /// Locked sessions come back runner-less: history is readable, queries
    /// yield a recoverable error.
    pub async fn resume_session(&self, session_id: i64) -> Result<Arc<AgentSession>> {
        if let Some(existing) = self.get_session(session_id) {
            return Ok(existing);
        }

        let row = self
            .store
            .get(session_id)?
            .ok_or(AgentError::SessionNotFound { id: session_id })?;

        let config = SessionConfig {
            working_dir: row.working_dir.clone(),
            personality: row.personality.clone().unwrap_or_default(),
            user_id: row.user_id.clone(),
            sandbox_mode: row.sandbox_mode,
            session_name: row.name.clone(),
            mission_id: row.mission_id,
            ..Default::default()
        };

        let session = if row.is_locked {
            Arc::new(AgentSession::new(session_id, config, true, false))
        } else {
            let session = Arc::new(AgentSession::new(
                session_id,
                config.clone(),
                false,
                row.claude_session_id.is_none(),
            ));
            let runner = self
                .build_runner(&config, session.broker(), row.claude_session_id.clone())
                .await?;
            *session.runner.lock().await = Some(runner);
            session
        };

        self.sessions.insert(session_id, session.clone());
        info!(session_id, locked = session.is_locked, "agent session resumed");
        Ok(session)
    }

    /// Announce a session to its client, with a sequence number so the
    /// announcement replays like any other event.
    pub fn session_ready_event(&self, session: &AgentSession) -> AgentEvent {
        let name = session.name.lock().unwrap().clone();
        session.add_event(AgentEvent::new(AgentEventBody::SessionReady {
            session_id: session.session_id,
            name,
            is_locked: session.is_locked,
        }))
    }

    /// Apply a new configuration to a live session by rebuilding its runner
    /// (the resume token is preserved; the event ring starts fresh).
    pub async fn update_session_config(
        &self,
        session_id: i64,
        config: SessionConfig,
    ) -> Result<Arc<AgentSession>> {
        let existing = self
            .get_session(session_id)
            .ok_or(AgentError::SessionNotFound { id: session_id })?;
        if existing.is_locked {
            return Err(AgentError::SessionLocked { id: session_id });
        }

        let resume_token = {
            let mut guard = existing.runner.lock().await;
            let token = guard.as_ref().and_then(|r| r.claude_session_id());
            if let Some(mut runner) = guard.take() {
                runner.close().await;
            }
            token
        };

        let session = Arc::new(AgentSession::new(
            session_id,
            config.clone(),
            false,
            resume_token.is_none(),
        ));
        let runner = self
            .build_runner(&config, session.broker(), resume_token)
            .await?;
        *session.runner.lock().await = Some(runner);

        self.sessions.insert(session_id, session.clone());
        info!(session_id, "agent session reconfigured");
        Ok(session)
    }

    /// Events a reconnecting client missed: everything in the ring with
    /// `seq > last_seq`, in order. More than `EVENT_BUFFER_SIZE` behind means
    /// the gap is unrecoverable and a full reload is expected.
    pub fn events_since(&self, session_id: i64, last_seq: u64) -> Vec<AgentEvent> {
        match self.sessions.get(&session_id) {
            Some(session) => session.ring.lock().unwrap().events_since(last_seq),
            None => Vec::new(),
        }
    }

    /// Signal cancellation for the active query. Returns true if there was
    /// a query to cancel.
    pub fn cancel_query(&self, session_id: i64) -> bool {
        let Some(session) = self.get_session(session_id) else {
            return false;
        };
        let token = session.cancel.lock().unwrap();
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        true
    }

    /// Resolve a pending permission request for a session.
    pub fn resolve_permission(
        &self,
        session_id: i64,
        request_id: &str,
        allowed: bool,
        deny_message: Option<String>,
    ) -> bool {
        match self.get_session(session_id) {
            Some(session) => session.broker.resolve(request_id, allowed, deny_message),
            None => false,
        }
    }

    /// Send a query and stream back events with sequence numbers.
    ///
    /// The stream terminates with exactly one of `done`, `cancelled`, or
    /// `error`.
    pub async fn query(
        &self,
        session: Arc<AgentSession>,
        prompt: String,
    ) -> mpsc::Receiver<AgentEvent> {
        let (out_tx, out_rx) = mpsc::channel(64);
        session.touch();

        // Locked sessions: a single recoverable error event and nothing else.
        if session.is_locked {
            let event = session.add_event(error_event(
                "Session is locked — its sandbox has been closed",
                true,
            ));
            let _ = out_tx.send(event).await;
            return out_rx;
        }

        {
            let mut initial = session.initial_prompt.lock().unwrap();
            if initial.is_none() {
                *initial = Some(prompt.clone());
            }
        }

        // Persist the user turn immediately (best-effort).
        if let Err(e) = self.store.append_conversation(
            session.session_id,
            &prompt,
            MessageRole::User,
            now_unix(),
            Some(QUERY_MEDIUM),
            session.config.user_id.as_deref(),
            None,
            &[],
        ) {
            debug!(error = %e, "failed to persist user conversation");
        }

        let started = {
            let mut guard = session.runner.lock().await;
            match guard.as_mut() {
                None => Err(None),
                Some(runner) => runner.query(&prompt).await.map_err(Some),
            }
        };
        let runner_rx = match started {
            Ok(rx) => rx,
            Err(None) => {
                let event = session.add_event(error_event("Session not initialized", true));
                let _ = out_tx.send(event).await;
                return out_rx;
            }
            Err(Some(e)) => {
                warn!(session_id = session.session_id, error = %e, "query failed to start");
                let event = session.add_event(error_event(e.to_string(), false));
                let _ = out_tx.send(event).await;
                return out_rx;
            }
        };

        let cancel = {
            let mut token = session.cancel.lock().unwrap();
            *token = CancellationToken::new();
            token.clone()
        };

        let store = self.store.clone();
        let session_task = session.clone();
        tokio::spawn(async move {
            stream_query(session_task, store, runner_rx, cancel, out_tx).await;
        });

        out_rx
    }

    /// End a session: generate a short summary of recent conversation (when
    /// there is content) and mark the row ended.
    ///
    /// Returns whether a summary was generated.
    pub async fn end_session(&self, session_id: i64) -> Result<bool> {
        let thirty_minutes_ago = now_unix() - 1800;
        let rows = self
            .store
            .recent_content(session_id, thirty_minutes_ago, 50)?;

        if rows.is_empty() {
            self.store.end(session_id, now_unix(), None)?;
            self.close_session(session_id).await;
            return Ok(false);
        }

        let content: String = rows
            .iter()
            .map(|(role, prompt)| format!("{}: {}\n", role.as_str(), prompt))
            .collect();
        let truncated: String = content.chars().take(2000).collect();
        let req = ChatRequest::new(
            self.default_model.clone(),
            "",
            format!(
                "Summarize this conversation in 1-2 concise sentences. \
                 Focus on what was discussed and any outcomes.\n\n{truncated}"
            ),
        );

        let summary = match self.provider.send(&req).await {
            Ok(resp) => Some(resp.content.trim().to_string()),
            Err(e) => {
                warn!(session_id, error = %e, "session summary generation failed");
                None
            }
        };

        self.store
            .end(session_id, now_unix(), summary.as_deref())?;
        self.close_session(session_id).await;
        Ok(summary.is_some())
    }

    /// Generate and persist a display name from the first exchange.
    pub async fn generate_session_name(&self, session_id: i64) -> Result<Option<String>> {
        let Some(session) = self.get_session(session_id) else {
            return Err(AgentError::SessionNotFound { id: session_id });
        };
        let prompt = session.initial_prompt.lock().unwrap().clone();
        let response = session.first_response.lock().unwrap().clone();
        let Some(prompt) = prompt else {
            return Ok(None);
        };

        let req = ChatRequest::new(
            self.default_model.clone(),
            "",
            format!(
                "Give this conversation a short title (max 5 words, no quotes).\n\n\
                 User: {}\nAssistant: {}",
                prompt.chars().take(300).collect::<String>(),
                response.unwrap_or_default().chars().take(300).collect::<String>(),
            ),
        );
        let name = self.provider.send(&req).await?.content.trim().to_string();
        if name.is_empty() {
            return Ok(None);
        }
        self.store.set_name(session_id, &name)?;
        *session.name.lock().unwrap() = Some(name.clone());
        Ok(Some(name))
    }

    /// Close and clean up one session. Sandbox sessions get locked in the
    /// database — the container is gone and cannot continue.
    pub async fn close_session(&self, session_id: i64) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(mut runner) = session.runner.lock().await.take() {
            runner.close().await;
        }
        if session.config.sandbox_mode {
            if let Err(e) = self.store.lock(session_id) {
                warn!(session_id, error = %e, "failed to lock sandbox session");
            }
        }
        info!(session_id, "agent session closed");
    }

    pub async fn close_all(&self) {
        let ids: Vec<i64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close_session(id).await;
        }
    }

    pub fn list_sessions(&self) -> Vec<(i64, SessionConfig)> {
        self.sessions
            .iter()
            .map(|e| (e.value().session_id, e.value().config.clone()))
            .collect()
    }

    /// Background task closing sandbox sessions idle past the timeout.
    pub fn spawn_idle_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SANDBOX_CLEANUP_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let idle_cutoff = Duration::from_secs(SANDBOX_IDLE_TIMEOUT_SECS);
                let stale: Vec<i64> = service
                    .sessions
                    .iter()
                    .filter(|e| e.value().config.sandbox_mode && e.value().idle_for() > idle_cutoff)
                    .map(|e| *e.key())
                    .collect();
                for session_id in stale {
                    info!(session_id, "closing idle sandbox session");
                    service.close_session(session_id).await;
                }
            }
        })
    }
}

/// Merge runner events and permission requests into one ordered stream,
/// accounting timing and assembling the persisted block list.
async fn stream_query(
    session: Arc<AgentSession>,
    store: Arc<SessionStore>,
    mut runner_rx: mpsc::Receiver<RunnerEvent>,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<AgentEvent>,
) {
    let t0 = Instant::now();
    let mut first_token_at: Option<Instant> = None;
    let mut thinking_window_start: Option<Instant> = None;
    let mut thinking_total = Duration::ZERO;
    let mut assembler = BlockAssembler::new();
    let mut tool_count: u32 = 0;
    let mut tool_use_count: i64 = 0;
    let mut tool_names: Vec<String> = Vec::new();
    let mut finished = false;

    let mut permission_rx = session.permission_rx.lock().await;

    let close_thinking =
        |start: &mut Option<Instant>, total: &mut Duration| {
            if let Some(opened) = start.take() {
                *total += opened.elapsed();
            }
        };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let event = session.add_event(cancelled_event());
                let _ = out_tx.send(event).await;
                return;
            }

            request = permission_rx.recv() => {
                if let Some(PermissionRequest { request_id, tool_name, tool_input }) = request {
                    let event = session.add_event(AgentEvent::new(AgentEventBody::PermissionRequest {
                        request_id,
                        tool_name,
                        tool_input,
                    }));
                    if out_tx.send(event).await.is_err() {
                        // Client is gone; keep streaming so the ring stays
                        // complete for a later replay.
                        continue;
                    }
                }
            }

            event = runner_rx.recv() => {
                let Some(event) = event else {
                    if !finished {
                        let out = session.add_event(error_event("runner stream ended unexpectedly", true));
                        let _ = out_tx.send(out).await;
                    }
                    return;
                };
                session.touch();

                match event {
                    RunnerEvent::SessionId(token) => {
                        if session.needs_token_capture.swap(false, Ordering::SeqCst) {
                            if let Err(e) = store.set_claude_session_id(session.session_id, &token) {
                                debug!(error = %e, "failed to persist resume token");
                            }
                        }
                    }
                    RunnerEvent::TextDelta(text) => {
                        if first_token_at.is_none() {
                            first_token_at = Some(Instant::now());
                        }
                        close_thinking(&mut thinking_window_start, &mut thinking_total);
                        assembler.push_text(&text);
                        let out = session.add_event(AgentEvent::new(AgentEventBody::Text { text }));
                        let _ = out_tx.send(out).await;
                    }
                    RunnerEvent::ThinkingDelta(text) => {
                        if first_token_at.is_none() {
                            first_token_at = Some(Instant::now());
                        }
                        if thinking_window_start.is_none() {
                            thinking_window_start = Some(Instant::now());
                        }
                        assembler.push_thinking(&text);
                        let out = session.add_event(AgentEvent::new(AgentEventBody::Thinking { text }));
                        let _ = out_tx.send(out).await;
                    }
                    RunnerEvent::ToolUse { id, name, input } => {
                        tool_count += 1;
                        tool_use_count += 1;
                        if !name.is_empty() && !tool_names.iter().any(|n| n == &name) {
                            tool_names.push(name.clone());
                        }
                        close_thinking(&mut thinking_window_start, &mut thinking_total);
                        assembler.push_tool_use(&id, &name, input.clone());
                        let out = session.add_event(AgentEvent::new(AgentEventBody::ToolUse {
                            id, name, input,
                        }));
                        let _ = out_tx.send(out).await;
                    }
                    RunnerEvent::ToolResult { tool_use_id, name, output, is_error } => {
                        tool_count += 1;
                        close_thinking(&mut thinking_window_start, &mut thinking_total);
                        assembler.push_tool_result(&tool_use_id, &name, &output, is_error);
                        let out = session.add_event(AgentEvent::new(AgentEventBody::ToolResult {
                            tool_use_id, name, output, is_error,
                        }));
                        let _ = out_tx.send(out).await;
                    }
                    RunnerEvent::Error { message, recoverable } => {
                        warn!(session_id = session.session_id, %message, "runner error");
                        let out = session.add_event(error_event(message, recoverable));
                        let _ = out_tx.send(out).await;
                        return;
                    }
                    RunnerEvent::Done { .. } => {
                        finished = true;
                        close_thinking(&mut thinking_window_start, &mut thinking_total);

                        let response_text = assembler.response_text();
                        {
                            let mut first = session.first_response.lock().unwrap();
                            if first.is_none() && !response_text.is_empty() {
                                *first = Some(response_text.clone());
                            }
                        }

                        let timings = first_token_at.map(|first| Timings {
                            time_to_first_token_ms: first.duration_since(t0).as_millis() as i64,
                            response_time_ms: t0.elapsed().as_millis() as i64,
                            thinking_ms: (thinking_total > Duration::ZERO)
                                .then(|| thinking_total.as_millis() as i64),
                        });

                        // Persist the assistant turn with its block list
                        // (best-effort: audit trail only).
                        let metrics = ConversationMetrics {
                            ttft_ms: timings.map(|t| t.time_to_first_token_ms),
                            response_ms: timings.map(|t| t.response_time_ms),
                            thinking_ms: timings.and_then(|t| t.thinking_ms),
                            tool_uses: tool_use_count,
                            tool_names: tool_names.clone(),
                        };
                        let blocks = std::mem::take(&mut assembler).finish();
                        if let Err(e) = store.append_conversation(
                            session.session_id,
                            &response_text,
                            MessageRole::Assistant,
                            now_unix(),
                            Some(QUERY_MEDIUM),
                            session.config.user_id.as_deref(),
                            Some(&metrics),
                            &blocks,
                        ) {
                            debug!(error = %e, "failed to persist assistant conversation");
                        }

                        let out = session.add_event(AgentEvent::new(AgentEventBody::Done {
                            response_text,
                            tool_count,
                            timings,
                        }));
                        let _ = out_tx.send(out).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ProviderError};
    use rusqlite::Connection;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn send(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: format!("re: {}", req.messages.last().unwrap().content),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    fn service() -> Arc<AgentService> {
        let conn = Connection::open_in_memory().unwrap();
        dere_sessions::db::init_db(&conn).unwrap();
        Arc::new(AgentService::new(
            Arc::new(SessionStore::new(conn)),
            Arc::new(EchoProvider),
            Arc::new(PersonalityLoader::with_dir("/nonexistent")),
            None,
            SandboxConfig::default(),
            ContextConfig {
                time: false,
                weather: false,
            },
            "test-model".to_string(),
        ))
    }

    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_across_queries() {
        let service = service();
        let session = service
            .create_session(SessionConfig {
                working_dir: "/tmp".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = drain(service.query(session.clone(), "one".into()).await).await;
        let second = drain(service.query(session.clone(), "two".into()).await).await;

        let seqs: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.seq.unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]), "non-monotonic: {seqs:?}");
        assert!(matches!(
            first.last().unwrap().body,
            AgentEventBody::Done { .. }
        ));
    }

    #[tokio::test]
    async fn replay_returns_exactly_the_missed_events() {
        let service = service();
        let session = service
            .create_session(SessionConfig {
                working_dir: "/tmp".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let all = drain(service.query(session.clone(), "hello".into()).await).await;
        let cut = all[all.len() / 2].seq.unwrap();

        let replayed = service.events_since(session.session_id, cut);
        let expected: Vec<u64> = all
            .iter()
            .filter_map(|e| e.seq)
            .filter(|s| *s > cut)
            .collect();
        let got: Vec<u64> = replayed.iter().filter_map(|e| e.seq).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn locked_session_yields_single_recoverable_error() {
        let service = service();
        let id = service
            .store()
            .create(&NewSession {
                working_dir: "/tmp".into(),
                medium: "agent_api".into(),
                sandbox_mode: true,
                ..Default::default()
            })
            .unwrap();
        service.store().lock(id).unwrap();

        let session = service.resume_session(id).await.unwrap();
        assert!(session.is_locked);

        let events = drain(service.query(session, "hi".into()).await).await;
        assert_eq!(events.len(), 1);
        match &events[0].body {
            AgentEventBody::Error { recoverable, .. } => assert!(recoverable),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn done_persists_assistant_turn_with_metrics() {
        let service = service();
        let session = service
            .create_session(SessionConfig {
                working_dir: "/tmp".into(),
                user_id: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        drain(service.query(session.clone(), "hello".into()).await).await;

        let history = service.store().history(session.session_id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_type, MessageRole::Assistant);
        assert_eq!(history[0].prompt, "re: hello");
        assert!(history[0].metrics.as_ref().unwrap().response_ms.is_some());
    }

    #[tokio::test]
    async fn resume_reuses_stored_token() {
        let service = service();
        let session = service
            .create_session(SessionConfig {
                working_dir: "/tmp".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        drain(service.query(session.clone(), "hi".into()).await).await;

        let row = service.store().get(session.session_id).unwrap().unwrap();
        assert!(row.claude_session_id.is_some());
    }
}
