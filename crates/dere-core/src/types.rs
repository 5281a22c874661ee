use serde::{Deserialize, Serialize};

/// Delivery priority for proactive notifications.
///
/// `Alert` outranks `Conversation` in queue ordering — a simple ping about an
/// overdue deadline should reach the adapter before an open-ended chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Conversation,
    Alert,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Alert => "alert",
            Priority::Conversation => "conversation",
        }
    }

    /// Numeric rank used in the notification queue `ORDER BY` clause.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Alert => 1,
            Priority::Conversation => 0,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Priority::Alert),
            "conversation" => Ok(Priority::Conversation),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a single conversation turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_outranks_conversation() {
        assert!(Priority::Alert > Priority::Conversation);
        assert!(Priority::Alert.rank() > Priority::Conversation.rank());
    }

    #[test]
    fn priority_roundtrips_through_str() {
        for p in [Priority::Alert, Priority::Conversation] {
            let parsed: Priority = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
    }
}
