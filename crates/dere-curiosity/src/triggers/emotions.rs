use regex::Regex;
use std::sync::OnceLock;

use crate::types::{CuriositySignal, CuriosityType};

use super::truncate;

const POSITIVE_WORDS: &[(&str, f64)] = &[
    ("love", 0.9),
    ("amazing", 0.8),
    ("excited", 0.8),
    ("thrilled", 0.9),
    ("obsessed", 0.7),
    ("fantastic", 0.8),
    ("incredible", 0.8),
    ("awesome", 0.7),
    ("best", 0.6),
];

const NEGATIVE_WORDS: &[(&str, f64)] = &[
    ("hate", 0.9),
    ("furious", 0.9),
    ("angry", 0.7),
    ("frustrated", 0.7),
    ("annoyed", 0.6),
    ("disappointed", 0.6),
    ("upset", 0.7),
    ("terrible", 0.7),
    ("awful", 0.8),
];

fn excited_punct() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!{2,}").unwrap())
}

fn stretched_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-zA-Z])\1{2,}").unwrap())
}

/// Emotionally intense messages merit a follow-up exploration — strong
/// feelings mark topics the user actually cares about.
pub fn detect_emotional_peak(prompt: &str) -> Option<CuriositySignal> {
    let text = prompt.trim();
    if text.chars().count() < 6 {
        return None;
    }

    let (intensity, reason) = score_intensity(text);
    if intensity < 0.7 {
        return None;
    }

    let mut signal = CuriositySignal::new(
        CuriosityType::EmotionalPeak,
        truncate(text, 80),
        truncate(text, 400),
        reason,
        (intensity + 0.1).min(1.0),
    );
    signal.metadata = serde_json::json!({ "intensity": intensity });
    Some(signal)
}

fn score_intensity(text: &str) -> (f64, String) {
    let lowered = text.to_lowercase();
    let mut score = 0.0;
    let mut reasons: Vec<String> = Vec::new();

    for (word, weight) in POSITIVE_WORDS {
        if lowered.contains(word) {
            score += weight;
            reasons.push(format!("positive:{word}"));
        }
    }
    for (word, weight) in NEGATIVE_WORDS {
        if lowered.contains(word) {
            score += weight;
            reasons.push(format!("negative:{word}"));
        }
    }

    if excited_punct().is_match(text) {
        score += 0.4;
        reasons.push("exclamation".to_string());
    }
    if stretched_word().is_match(text) {
        score += 0.2;
        reasons.push("stretched_words".to_string());
    }

    let uppercase = uppercase_ratio(text);
    if uppercase > 0.4 && text.chars().count() > 8 {
        score += 0.3;
        reasons.push("uppercase".to_string());
    }

    let intensity = (score / 2.0).min(1.0);
    let reason = if reasons.is_empty() {
        "high emotional intensity".to_string()
    } else {
        format!(
            "high emotional intensity ({})",
            reasons.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
        )
    };

    (intensity, reason)
}

fn uppercase_ratio(text: &str) -> f64 {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return 0.0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_exclamation_does_not_peak() {
        // One "!" is ordinary punctuation; only repeated exclamation marks
        // count toward intensity.
        assert!(detect_emotional_peak("I love purple!").is_none());
    }

    #[test]
    fn shouted_love_with_repeated_exclamations_peaks() {
        let signal = detect_emotional_peak("I LOVE purple!!").expect("peak detected");
        assert_eq!(signal.curiosity_type, CuriosityType::EmotionalPeak);
        // love (0.9) + !! (0.4) + uppercase (0.3) over the 2.0 divisor
        let intensity = signal.metadata["intensity"].as_f64().unwrap();
        assert!((intensity - 0.8).abs() < 1e-9);
        assert!((signal.user_interest - 0.9).abs() < 1e-9);
    }

    #[test]
    fn strong_compound_emotion_is_detected() {
        let signal =
            detect_emotional_peak("I LOVE this, it's AMAZING!!").expect("peak detected");
        assert!(signal.user_interest > 0.8);
        assert!(signal.metadata["intensity"].as_f64().unwrap() >= 0.7);
    }

    #[test]
    fn neutral_text_is_ignored() {
        assert!(detect_emotional_peak("can you check the weather").is_none());
    }

    #[test]
    fn mild_positive_does_not_peak() {
        assert!(detect_emotional_peak("this is the best").is_none());
    }

    #[test]
    fn topic_is_truncated() {
        let long = format!("I love {}!!! it's amazing and incredible", "x".repeat(200));
        let signal = detect_emotional_peak(&long).expect("peak detected");
        assert!(signal.topic.chars().count() <= 83);
        assert!(signal.topic.ends_with("..."));
    }
}
