pub mod context;
pub mod emotion;
pub mod health;
pub mod notifications;
pub mod presence;
pub mod routing;
pub mod sessions;
