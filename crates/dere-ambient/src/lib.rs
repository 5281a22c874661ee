pub mod activity;
pub mod analyzer;
pub mod error;
pub mod fsm;
pub mod monitor;
pub mod routing;

pub use error::{AmbientError, Result};
pub use fsm::{AmbientFsm, AmbientState};
pub use monitor::{AmbientHandle, AmbientMonitor};
pub use routing::MessageRouter;
