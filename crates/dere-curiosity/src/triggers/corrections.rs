use regex::Regex;
use std::sync::OnceLock;

use crate::types::{CuriositySignal, CuriosityType};

use super::truncate;

fn correction_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)^(no|nah|not quite|actually|correction)\b").unwrap(),
            Regex::new(r"(?i)\b(it's|it is|that's|that is)\s+(actually|not)\b").unwrap(),
            Regex::new(r"(?i)\b(i meant|i said|what i meant)\b").unwrap(),
            Regex::new(r"(?i)\b(correct(ing)?|to clarify|let me clarify)\b").unwrap(),
        ]
    })
}

fn topic_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)\b(?:it's|it is|that's|that is)\s+(?:actually\s+)?(?P<topic>.+)")
                .unwrap(),
            Regex::new(r"(?i)\b(?:correct(?:ing)?|correction):?\s+(?P<topic>.+)").unwrap(),
        ]
    })
}

/// The user contradicted the assistant — a high-value signal that what we
/// believed is wrong.
pub fn detect_correction(prompt: &str, previous_assistant: Option<&str>) -> Option<CuriositySignal> {
    let previous_assistant = previous_assistant?;

    if !looks_like_correction(prompt) {
        return None;
    }

    let topic = extract_topic(prompt);
    let source_context = format!(
        "Assistant: {}\nUser: {}",
        truncate(previous_assistant, 200),
        truncate(prompt, 200),
    );

    Some(CuriositySignal::new(
        CuriosityType::Correction,
        topic,
        source_context,
        "User corrected the assistant",
        0.7,
    ))
}

fn looks_like_correction(prompt: &str) -> bool {
    let text = prompt.trim();
    if text.chars().count() < 6 {
        return false;
    }
    correction_patterns().iter().any(|p| p.is_match(text))
}

fn extract_topic(prompt: &str) -> String {
    for pattern in topic_patterns() {
        if let Some(caps) = pattern.captures(prompt) {
            if let Some(topic) = caps.name("topic") {
                let candidate = topic.as_str().trim();
                if !candidate.is_empty() {
                    return truncate(candidate, 80);
                }
            }
        }
    }
    truncate(prompt.trim(), 80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_explicit_correction() {
        let signal = detect_correction(
            "No, it's actually a secondary color",
            Some("Purple is a primary color."),
        )
        .expect("correction detected");
        assert_eq!(signal.curiosity_type, CuriosityType::Correction);
        assert_eq!(signal.topic, "a secondary color");
        assert!((signal.user_interest - 0.7).abs() < 1e-9);
    }

    #[test]
    fn no_previous_assistant_means_no_correction() {
        assert!(detect_correction("no, that's wrong", None).is_none());
    }

    #[test]
    fn plain_agreement_is_not_a_correction() {
        assert!(detect_correction("sounds great, thanks", Some("Shall I?")).is_none());
    }

    #[test]
    fn short_messages_are_ignored() {
        assert!(detect_correction("no", Some("Is it blue?")).is_none());
    }
}
