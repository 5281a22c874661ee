use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmbientError {
    #[error("Storage error: {0}")]
    Sessions(#[from] dere_sessions::SessionError),

    #[error("Notification error: {0}")]
    Notify(#[from] dere_notify::NotifyError),

    #[error("Presence error: {0}")]
    Presence(#[from] dere_presence::PresenceError),

    #[error("Curiosity error: {0}")]
    Curiosity(#[from] dere_curiosity::CuriosityError),

    #[error("Provider error: {0}")]
    Provider(#[from] dere_agent::provider::ProviderError),
}

pub type Result<T> = std::result::Result<T, AmbientError>;
