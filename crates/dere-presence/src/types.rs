use serde::{Deserialize, Serialize};

/// A destination an adapter can deliver to — a channel or DM as the medium
/// sees it. Extra adapter-specific keys survive the round trip via `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChannelInfo {
    /// True for direct-message style destinations.
    pub fn is_dm(&self) -> bool {
        self.channel_type.as_deref() == Some("dm")
    }
}

/// Online state of one (medium, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub medium: String,
    pub user_id: String,
    pub available_channels: Vec<ChannelInfo>,
    /// RFC3339 time of the last heartbeat.
    pub last_heartbeat: String,
}
