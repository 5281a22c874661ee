use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Notification not found: {id}")]
    NotFound { id: i64 },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
