pub mod collector;
pub mod corrections;
pub mod emotions;
pub mod entities;
pub mod knowledge_gap;
pub mod unfinished_thread;

pub use collector::{TriggerCollector, TurnContext};
pub use entities::EntityNode;

/// Cap a snippet for storage, appending an ellipsis when cut.
pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}
