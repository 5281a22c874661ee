use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use dere_agent::provider::{ChatRequest, LlmProvider};
use dere_core::config::PRESENCE_STALE_SECS;
use dere_core::types::Priority;
use dere_curiosity::explorer::parse_mission_output;
use dere_presence::types::PresenceEntry;
use dere_presence::PresenceRegistry;

/// Where a message should go and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub medium: String,
    pub location: String,
    pub reasoning: String,
}

/// LLM-assisted routing over the presence registry.
///
/// The model picks among *reachable* destinations only; anything it answers
/// outside that set gets clamped back onto a reachable channel (DM
/// preferred). No online medium at all means no routing decision.
pub struct MessageRouter {
    presence: Arc<PresenceRegistry>,
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl MessageRouter {
    pub fn new(presence: Arc<PresenceRegistry>, provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self {
            presence,
            provider,
            model,
        }
    }

    pub async fn decide(
        &self,
        user_id: &str,
        message: &str,
        priority: Priority,
        user_activity: &Value,
    ) -> Option<RoutingDecision> {
        let online = match self.presence.list_online(user_id, PRESENCE_STALE_SECS) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "presence lookup failed");
                return None;
            }
        };
        if online.is_empty() {
            info!(user_id, "no reachable medium, skipping routing");
            return None;
        }

        let prompt = build_routing_prompt(&online, message, priority, user_activity);
        let req = ChatRequest::new(self.model.clone(), ROUTING_SYSTEM_PROMPT, prompt);

        let raw = match self.provider.send(&req).await {
            Ok(resp) => resp.content,
            Err(e) => {
                warn!(error = %e, "routing LLM call failed");
                return None;
            }
        };

        let parsed = parse_mission_output(&raw)?;
        let medium = parsed.get("medium")?.as_str()?.to_string();
        let location = parsed
            .get("location")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let reasoning = parsed
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("llm routing")
            .to_string();

        Some(clamp_to_reachable(&online, medium, location, reasoning))
    }
}

const ROUTING_SYSTEM_PROMPT: &str = "You route proactive assistant messages to chat destinations. \
Respond with a JSON object: {\"medium\": \"...\", \"location\": \"...\", \"reasoning\": \"...\"}. \
Only choose from the destinations listed in the request.";

fn build_routing_prompt(
    online: &[PresenceEntry],
    message: &str,
    priority: Priority,
    user_activity: &Value,
) -> String {
    let mut destinations = String::new();
    for entry in online {
        destinations.push_str(&format!("- medium \"{}\": channels ", entry.medium));
        let channels: Vec<String> = entry
            .available_channels
            .iter()
            .map(|c| {
                format!(
                    "{{id: \"{}\", name: \"{}\", type: \"{}\"}}",
                    c.id,
                    c.name.as_deref().unwrap_or(""),
                    c.channel_type.as_deref().unwrap_or(""),
                )
            })
            .collect();
        destinations.push_str(&channels.join(", "));
        destinations.push('\n');
    }

    format!(
        "Message to deliver: {message}\n\
         Priority: {priority}\n\
         User activity: {user_activity}\n\n\
         Reachable destinations:\n{destinations}\n\
         Pick the single best destination for this message."
    )
}

/// Force the LLM's answer onto the reachable set. Unknown medium falls back
/// to the first online one; unknown location falls back to a DM-type channel
/// (or the first channel) of the chosen medium.
fn clamp_to_reachable(
    online: &[PresenceEntry],
    medium: String,
    location: String,
    reasoning: String,
) -> RoutingDecision {
    let entry = online
        .iter()
        .find(|e| e.medium == medium)
        .unwrap_or_else(|| &online[0]);

    let location_known = entry.available_channels.iter().any(|c| c.id == location);
    let final_location = if location_known {
        location
    } else {
        entry
            .available_channels
            .iter()
            .find(|c| c.is_dm())
            .or_else(|| entry.available_channels.first())
            .map(|c| c.id.clone())
            .unwrap_or_default()
    };

    let reasoning = if entry.medium == medium && location_known {
        reasoning
    } else {
        format!("{reasoning} (clamped to reachable destination)")
    };

    RoutingDecision {
        medium: entry.medium.clone(),
        location: final_location,
        reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dere_presence::types::ChannelInfo;

    fn entry(medium: &str, channels: &[(&str, &str)]) -> PresenceEntry {
        PresenceEntry {
            medium: medium.to_string(),
            user_id: "alice".to_string(),
            available_channels: channels
                .iter()
                .map(|(id, kind)| ChannelInfo {
                    id: id.to_string(),
                    name: None,
                    channel_type: Some(kind.to_string()),
                    extra: Default::default(),
                })
                .collect(),
            last_heartbeat: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn reachable_choice_passes_through() {
        let online = vec![entry("discord", &[("123", "dm"), ("456", "text")])];
        let decision = clamp_to_reachable(
            &online,
            "discord".into(),
            "456".into(),
            "channel fits".into(),
        );
        assert_eq!(decision.medium, "discord");
        assert_eq!(decision.location, "456");
        assert_eq!(decision.reasoning, "channel fits");
    }

    #[test]
    fn unknown_medium_clamps_to_first_online() {
        let online = vec![entry("discord", &[("123", "dm")])];
        let decision = clamp_to_reachable(&online, "telegram".into(), "999".into(), "r".into());
        assert_eq!(decision.medium, "discord");
        assert_eq!(decision.location, "123");
        assert!(decision.reasoning.contains("clamped"));
    }

    #[test]
    fn unknown_location_prefers_dm_channel() {
        let online = vec![entry("discord", &[("456", "text"), ("123", "dm")])];
        let decision = clamp_to_reachable(&online, "discord".into(), "zzz".into(), "r".into());
        assert_eq!(decision.location, "123");
    }
}
