use serde_json::Map;

use crate::types::{CuriositySignal, CuriosityType};

/// Weights of the curiosity priority formula. They sum to 1.0.
#[derive(Debug, Clone, Copy)]
pub struct PriorityWeights {
    pub user_interest: f64,
    pub knowledge_gap: f64,
    pub type_weight: f64,
    pub recency: f64,
    pub exploration_boost: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            user_interest: 0.30,
            knowledge_gap: 0.25,
            type_weight: 0.20,
            recency: 0.15,
            exploration_boost: 0.10,
        }
    }
}

fn type_weight(curiosity_type: CuriosityType) -> f64 {
    match curiosity_type {
        CuriosityType::Correction => 0.9,
        CuriosityType::EmotionalPeak => 0.7,
        CuriosityType::UnfinishedThread => 0.6,
        CuriosityType::KnowledgeGap => 0.6,
        CuriosityType::UnfamiliarEntity => 0.5,
        CuriosityType::ResearchChain => 0.4,
    }
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Score a signal into [0, 1] plus the factor breakdown stored with the task.
///
/// `exploration_count` damps re-exploration; `recency` decays linearly over
/// the type's TTL.
pub fn compute_priority(
    signal: &CuriositySignal,
    exploration_count: u32,
    recency: f64,
) -> (f64, Map<String, serde_json::Value>) {
    let weights = PriorityWeights::default();

    let exploration_boost = if exploration_count == 0 {
        1.0
    } else {
        (1.0 - 0.1 * f64::from(exploration_count)).max(0.0)
    };

    let user_interest = clamp(signal.user_interest);
    let knowledge_gap = clamp(signal.knowledge_gap);
    let type_w = clamp(type_weight(signal.curiosity_type));
    let recency = clamp(recency);
    let exploration_boost = clamp(exploration_boost);

    let score = weights.user_interest * user_interest
        + weights.knowledge_gap * knowledge_gap
        + weights.type_weight * type_w
        + weights.recency * recency
        + weights.exploration_boost * exploration_boost;

    let mut factors = Map::new();
    factors.insert("user_interest".into(), user_interest.into());
    factors.insert("knowledge_gap".into(), knowledge_gap.into());
    factors.insert("type_weight".into(), type_w.into());
    factors.insert("recency".into(), recency.into());
    factors.insert("exploration_boost".into(), exploration_boost.into());

    (clamp(score), factors)
}

/// Bonus applied when the same topic keeps coming up: 0.05 per trigger,
/// capped at 0.2.
pub fn repeat_bonus(trigger_count: u32) -> f64 {
    (0.05 * f64::from(trigger_count)).min(0.2)
}

/// Final integer priority stored on the task row.
pub fn to_task_priority(score: f64) -> i64 {
    (score.clamp(0.0, 1.0) * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emotional_peak_scores_as_expected() {
        // intensity 0.8 gives user_interest 0.9; fresh signal, never explored.
        let signal = CuriositySignal::new(
            CuriosityType::EmotionalPeak,
            "I LOVE purple!!",
            "I LOVE purple!!",
            "high emotional intensity",
            0.9,
        );
        let (score, factors) = compute_priority(&signal, 0, 1.0);
        // 0.30*0.9 + 0.25*0 + 0.20*0.7 + 0.15*1.0 + 0.10*1.0 = 0.66
        assert!((score - 0.66).abs() < 1e-9);
        assert_eq!(to_task_priority(score), 66);
        assert_eq!(factors["exploration_boost"], serde_json::json!(1.0));
    }

    #[test]
    fn corrections_outrank_research_chains() {
        let correction = CuriositySignal::new(
            CuriosityType::Correction,
            "t",
            "c",
            "r",
            0.7,
        );
        let chain = CuriositySignal::new(CuriosityType::ResearchChain, "t", "c", "r", 0.7);
        let (a, _) = compute_priority(&correction, 0, 1.0);
        let (b, _) = compute_priority(&chain, 0, 1.0);
        assert!(a > b);
    }

    #[test]
    fn exploration_boost_decays_with_count() {
        let signal = CuriositySignal::new(CuriosityType::KnowledgeGap, "t", "c", "r", 0.5);
        let (fresh, _) = compute_priority(&signal, 0, 1.0);
        let (explored, _) = compute_priority(&signal, 5, 1.0);
        let (exhausted, factors) = compute_priority(&signal, 20, 1.0);
        assert!(fresh > explored);
        assert!(explored > exhausted);
        assert_eq!(factors["exploration_boost"], serde_json::json!(0.0));
    }

    #[test]
    fn repeat_bonus_caps_at_point_two() {
        assert!((repeat_bonus(1) - 0.05).abs() < 1e-9);
        assert!((repeat_bonus(3) - 0.15).abs() < 1e-9);
        assert!((repeat_bonus(10) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn score_clamps_to_unit_interval() {
        let signal = CuriositySignal {
            user_interest: 5.0,
            knowledge_gap: 5.0,
            ..CuriositySignal::new(CuriosityType::Correction, "t", "c", "r", 0.0)
        };
        let (score, _) = compute_priority(&signal, 0, 5.0);
        assert!(score <= 1.0);
    }
}
