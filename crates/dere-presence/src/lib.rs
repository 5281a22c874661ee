pub mod db;
pub mod error;
pub mod registry;
pub mod types;

pub use error::{PresenceError, Result};
pub use registry::PresenceRegistry;
