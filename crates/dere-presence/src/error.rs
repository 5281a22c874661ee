use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid channel payload: {0}")]
    InvalidChannels(String),
}

pub type Result<T> = std::result::Result<T, PresenceError>;
