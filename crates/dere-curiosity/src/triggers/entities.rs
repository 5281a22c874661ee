use regex::Regex;

use crate::types::{CuriositySignal, CuriosityType};

use super::truncate;

const GENERIC_ENTITY_NAMES: &[&str] = &["user", "assistant", "ai", "system", "daemon"];
const MAX_ENTITIES: usize = 3;

/// A freshly extracted knowledge-graph node, as handed over by the
/// extraction collaborator.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub name: String,
    pub labels: Vec<String>,
}

/// New entities the graph has never seen are things worth learning about.
///
/// Filters out generic/self references and names that are just log-line
/// prefixes in pasted terminal output. At most three signals per message.
pub fn detect_unfamiliar_entities(
    prompt: &str,
    nodes: &[EntityNode],
    speaker_name: Option<&str>,
    personality: Option<&str>,
) -> Vec<CuriositySignal> {
    if nodes.is_empty() || prompt.trim().is_empty() {
        return Vec::new();
    }

    let mut signals = Vec::new();
    for node in nodes {
        let name = node.name.trim();
        if name.is_empty() {
            continue;
        }
        if is_generic_entity(node, name, speaker_name, personality) {
            continue;
        }
        if appears_as_log_prefix(name, prompt) {
            continue;
        }

        signals.push(CuriositySignal::new(
            CuriosityType::UnfamiliarEntity,
            name,
            truncate(prompt, 400),
            "New entity extracted from user message",
            0.4,
        ));

        if signals.len() >= MAX_ENTITIES {
            break;
        }
    }
    signals
}

fn is_generic_entity(
    node: &EntityNode,
    name: &str,
    speaker_name: Option<&str>,
    personality: Option<&str>,
) -> bool {
    if name.chars().count() < 3 {
        return true;
    }

    let normalized = name.to_lowercase();
    if GENERIC_ENTITY_NAMES.contains(&normalized.as_str()) {
        return true;
    }

    if node
        .labels
        .iter()
        .any(|l| matches!(l.to_lowercase().as_str(), "user" | "assistant" | "ai"))
    {
        return true;
    }

    if let Some(speaker) = speaker_name {
        if normalized == speaker.trim().to_lowercase() {
            return true;
        }
    }
    if let Some(personality) = personality {
        if normalized == personality.trim().to_lowercase() {
            return true;
        }
    }

    false
}

/// `name | message` at line start is service-log output, not a topic.
fn appears_as_log_prefix(name: &str, prompt: &str) -> bool {
    let normalized = regex::escape(&name.to_lowercase());
    let Ok(pattern) = Regex::new(&format!(r"^\s*{normalized}(?:\.\d+)?\s*\|")) else {
        return false;
    };
    prompt
        .lines()
        .any(|line| pattern.is_match(&line.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> EntityNode {
        EntityNode {
            name: name.to_string(),
            labels: Vec::new(),
        }
    }

    #[test]
    fn new_entity_produces_signal() {
        let signals = detect_unfamiliar_entities(
            "I started learning Esperanto yesterday",
            &[node("Esperanto")],
            Some("alice"),
            Some("tsun"),
        );
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].topic, "Esperanto");
        assert_eq!(signals[0].curiosity_type, CuriosityType::UnfamiliarEntity);
    }

    #[test]
    fn generic_and_self_references_are_filtered() {
        let signals = detect_unfamiliar_entities(
            "talk to the assistant about alice and tsun",
            &[node("assistant"), node("alice"), node("tsun"), node("ab")],
            Some("alice"),
            Some("tsun"),
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn log_prefixes_are_filtered() {
        let prompt = "look at this:\npostgres.1 | connection refused";
        let signals = detect_unfamiliar_entities(prompt, &[node("postgres")], None, None);
        assert!(signals.is_empty());
    }

    #[test]
    fn at_most_three_entities_per_message() {
        let nodes: Vec<EntityNode> = ["alpha", "bravo", "charlie", "delta", "echo"]
            .iter()
            .map(|n| node(n))
            .collect();
        let signals = detect_unfamiliar_entities("many new things", &nodes, None, None);
        assert_eq!(signals.len(), 3);
    }
}
