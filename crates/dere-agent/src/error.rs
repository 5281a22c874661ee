use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Session not found: {id}")]
    SessionNotFound { id: i64 },

    #[error("Session {id} is locked — no further queries accepted")]
    SessionLocked { id: i64 },

    #[error("Storage error: {0}")]
    Storage(#[from] dere_sessions::SessionError),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Sandbox failed to start: {0}")]
    SandboxStart(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
