use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{CuriositySignal, CuriosityType};

use super::truncate;

// Affirmative/negative responses that answer yes/no questions
const DIRECT_RESPONSES: &[&str] = &[
    "yeah",
    "yes",
    "yep",
    "yup",
    "sure",
    "ok",
    "okay",
    "k",
    "do it",
    "go ahead",
    "go for it",
    "sounds good",
    "let's do it",
    "please",
    "please do",
    "that works",
    "perfect",
    "great",
    "no",
    "nope",
    "nah",
    "don't",
    "skip",
    "never mind",
    "nevermind",
    "not now",
    "maybe later",
    "hold off",
    "wait",
];

fn code_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").unwrap())
}

fn question() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\n?]{1,240}\?").unwrap())
}

/// The assistant asked something, and the user pivoted to a different topic
/// without answering. The open question is worth circling back to.
///
/// Direct yes/no style replies never count — answering a question is not
/// abandoning it.
pub fn detect_unfinished_thread(
    prompt: &str,
    previous_assistant: Option<&str>,
) -> Option<CuriositySignal> {
    let previous_assistant = previous_assistant?;
    let question = extract_last_question(previous_assistant)?;

    let user_text = prompt.trim();
    if user_text.chars().count() < 4 {
        return None;
    }

    if is_direct_response(user_text) {
        return None;
    }

    let overlap = token_overlap(&question, user_text);
    if overlap < 0.15 {
        let source_context = format!(
            "Assistant question: {}\nUser: {}",
            truncate(&question, 200),
            truncate(user_text, 200),
        );
        return Some(CuriositySignal::new(
            CuriosityType::UnfinishedThread,
            truncate(&question, 80),
            source_context,
            "User changed topic after a question",
            0.5,
        ));
    }

    None
}

/// Does the text look like a direct answer to a yes/no question?
fn is_direct_response(text: &str) -> bool {
    let normalized = text.to_lowercase();
    let normalized = normalized.trim();
    for phrase in DIRECT_RESPONSES {
        if let Some(rest) = normalized.strip_prefix(phrase) {
            // Word boundary check so "yeast" does not match "yea".
            if rest.is_empty() || !rest.chars().next().unwrap().is_alphanumeric() {
                return true;
            }
        }
    }
    false
}

fn extract_last_question(text: &str) -> Option<String> {
    let cleaned = code_block().replace_all(text, "");
    let last = question().find_iter(&cleaned).last()?;
    let question = strip_markdown(last.as_str().trim());
    if !question.chars().any(|c| c.is_alphanumeric()) {
        return None;
    }
    Some(truncate(&question, 120))
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens_a = tokens(a);
    let tokens_b = tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

fn tokens(text: &str) -> HashSet<String> {
    let normalized = text.to_lowercase();
    let words: Vec<String> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect();
    if words.len() >= 2 {
        return words.into_iter().collect();
    }

    // Single-word messages: fall back to 4-gram shingles so short replies
    // still overlap with related short questions.
    let compact: String = normalized.chars().filter(|c| c.is_alphanumeric()).collect();
    if compact.chars().count() < 4 {
        return if compact.is_empty() {
            HashSet::new()
        } else {
            HashSet::from([compact])
        };
    }
    let chars: Vec<char> = compact.chars().collect();
    chars
        .windows(4)
        .map(|w| w.iter().collect::<String>())
        .collect()
}

fn strip_markdown(text: &str) -> String {
    static LEADING: OnceLock<Regex> = OnceLock::new();
    static INLINE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let leading = LEADING.get_or_init(|| Regex::new(r"^[\s>*`_\-\d\.)]+").unwrap());
    let inline = INLINE.get_or_init(|| Regex::new(r"[`*_]+").unwrap());
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());

    let cleaned = leading.replace(text, "");
    let cleaned = inline.replace_all(&cleaned, "");
    spaces.replace_all(&cleaned, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_pivot_is_detected() {
        let signal = detect_unfinished_thread(
            "what's the weather like today",
            Some("Should I set up the database migration for you?"),
        )
        .expect("pivot detected");
        assert_eq!(signal.curiosity_type, CuriosityType::UnfinishedThread);
        assert!(signal.topic.contains("database migration"));
    }

    #[test]
    fn direct_yes_answer_is_not_unfinished() {
        assert!(detect_unfinished_thread(
            "yes please",
            Some("Should I set up the database migration?")
        )
        .is_none());
        assert!(detect_unfinished_thread(
            "nah, skip it",
            Some("Should I set up the database migration?")
        )
        .is_none());
    }

    #[test]
    fn on_topic_reply_is_not_unfinished() {
        assert!(detect_unfinished_thread(
            "the database migration should use the staging config",
            Some("Should I set up the database migration for you?")
        )
        .is_none());
    }

    #[test]
    fn word_boundary_guards_direct_responses() {
        // "yeast" starts with "yea"-like phrases but is not an answer.
        let signal = detect_unfinished_thread(
            "yeast is fascinating stuff",
            Some("Should I order the groceries?"),
        );
        assert!(signal.is_some());
    }

    #[test]
    fn questions_inside_code_blocks_are_ignored() {
        let assistant = "Run this:\n```\nSELECT * FROM users WHERE active = ?\n```\nAll done.";
        assert!(detect_unfinished_thread("cool, unrelated topic here", Some(assistant)).is_none());
    }

    #[test]
    fn no_question_means_no_signal() {
        assert!(
            detect_unfinished_thread("something else", Some("Here is the summary.")).is_none()
        );
    }
}
