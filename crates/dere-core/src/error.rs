use thiserror::Error;

#[derive(Debug, Error)]
pub enum DereError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: i64 },

    #[error("Notification not found: {id}")]
    NotificationNotFound { id: i64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission request timed out after {secs}s")]
    PermissionTimeout { secs: u64 },

    #[error("Sandbox failed to start: {0}")]
    SandboxStart(String),

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DereError {
    /// Short error code string sent to clients in WS error events.
    pub fn code(&self) -> &'static str {
        match self {
            DereError::Config(_) => "CONFIG_ERROR",
            DereError::Storage(_) => "STORAGE_UNAVAILABLE",
            DereError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            DereError::NotificationNotFound { .. } => "NOTIFICATION_NOT_FOUND",
            DereError::InvalidInput(_) => "INVALID_INPUT",
            DereError::PermissionTimeout { .. } => "PERMISSION_TIMEOUT",
            DereError::SandboxStart(_) => "SANDBOX_START_FAILED",
            DereError::Provider(_) => "PROVIDER_ERROR",
            DereError::Serialization(_) => "SERIALIZATION_ERROR",
            DereError::Io(_) => "IO_ERROR",
            DereError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, DereError>;
