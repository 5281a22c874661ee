use regex::Regex;
use std::sync::OnceLock;

use crate::types::{CuriositySignal, CuriosityType};

use super::truncate;

fn hedging_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bi think\b",
            r"(?i)\bnot sure\b",
            r"(?i)\bnot certain\b",
            r"(?i)\buncertain\b",
            r"(?i)\bi don't know\b",
            r"(?i)\bi do not know\b",
            r"(?i)\bcan't verify\b",
            r"(?i)\bcannot verify\b",
            r"(?i)\bcan't confirm\b",
            r"(?i)\bcannot confirm\b",
            r"(?i)\bprobably\b",
            r"(?i)\bmaybe\b",
            r"(?i)\bguess\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn topic_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\babout\s+(?P<topic>[^.?!]+)",
            r"(?i)\bfor\s+(?P<topic>[^.?!]+)",
            r"(?i)\bon\s+(?P<topic>[^.?!]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Assistant hedging marks something we should go find out properly.
/// Runs on assistant turns only.
pub fn detect_knowledge_gap(prompt: &str, previous_user: Option<&str>) -> Option<CuriositySignal> {
    let text = prompt.trim();
    if text.chars().count() < 20 {
        return None;
    }

    if !hedging_patterns().iter().any(|p| p.is_match(text)) {
        return None;
    }

    let topic = extract_topic(text)
        .unwrap_or_else(|| truncate(previous_user.unwrap_or(text), 80));
    let source_context = format!(
        "Assistant: {}\nUser: {}",
        truncate(text, 220),
        truncate(previous_user.unwrap_or(""), 200),
    );

    let mut signal = CuriositySignal::new(
        CuriosityType::KnowledgeGap,
        topic,
        source_context,
        "Assistant expressed uncertainty",
        0.4,
    );
    signal.knowledge_gap = 0.8;
    Some(signal)
}

fn extract_topic(text: &str) -> Option<String> {
    for pattern in topic_patterns() {
        if let Some(caps) = pattern.captures(text) {
            if let Some(topic) = caps.name("topic") {
                let candidate = topic.as_str().trim();
                if !candidate.is_empty() {
                    return Some(truncate(candidate, 80));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hedging_creates_knowledge_gap_signal() {
        let signal = detect_knowledge_gap(
            "I'm not sure about the release date of that album",
            Some("when did it come out?"),
        )
        .expect("gap detected");
        assert_eq!(signal.curiosity_type, CuriosityType::KnowledgeGap);
        assert!((signal.knowledge_gap - 0.8).abs() < 1e-9);
        assert_eq!(signal.topic, "the release date of that album");
    }

    #[test]
    fn confident_answers_are_ignored() {
        assert!(detect_knowledge_gap(
            "The capital of France is Paris, established well before 1900.",
            None
        )
        .is_none());
    }

    #[test]
    fn short_hedges_are_ignored() {
        assert!(detect_knowledge_gap("maybe", None).is_none());
    }

    #[test]
    fn topic_falls_back_to_previous_user_message() {
        let signal = detect_knowledge_gap(
            "I don't know, that's beyond what I can verify",
            Some("how deep is Lake Baikal?"),
        )
        .expect("gap detected");
        assert_eq!(signal.topic, "how deep is Lake Baikal?");
    }
}
