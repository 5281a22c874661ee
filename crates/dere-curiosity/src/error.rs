use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuriosityError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    #[error("Agent error: {0}")]
    Agent(#[from] dere_agent::AgentError),

    #[error("Exploration output unusable: {0}")]
    BadExplorationOutput(String),
}

pub type Result<T> = std::result::Result<T, CuriosityError>;
