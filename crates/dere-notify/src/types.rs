use serde::{Deserialize, Serialize};

use dere_core::types::Priority;

/// Delivery state of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "delivered" => Ok(NotificationStatus::Delivered),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status: {other}")),
        }
    }
}

/// A proactive outbound message awaiting (or past) adapter delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub target_medium: String,
    pub target_location: String,
    pub message: String,
    pub priority: Priority,
    pub routing_reasoning: String,
    pub status: NotificationStatus,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub error_message: Option<String>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<String>,
    pub parent_notification_id: Option<i64>,
}

/// Why a notification was raised and what the world looked like at the time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    pub trigger_type: Option<String>,
    pub trigger_id: Option<String>,
    pub trigger_data: Option<serde_json::Value>,
    pub context_snapshot: Option<serde_json::Value>,
}

impl TriggerContext {
    pub fn is_empty(&self) -> bool {
        self.trigger_type.is_none()
            && self.trigger_id.is_none()
            && self.trigger_data.is_none()
            && self.context_snapshot.is_none()
    }
}

/// Fields for enqueueing a new notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub target_medium: String,
    pub target_location: String,
    pub message: String,
    pub priority: Priority,
    pub routing_reasoning: String,
    pub parent_notification_id: Option<i64>,
    pub context: TriggerContext,
}
