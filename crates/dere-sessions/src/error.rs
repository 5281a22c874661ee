use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Session not found: {id}")]
    NotFound { id: i64 },

    #[error("Session {id} has ended and is immutable")]
    Ended { id: i64 },

    #[error("Invalid message role: {0}")]
    InvalidRole(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
