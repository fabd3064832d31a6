//! Success and failure patterns learned from executed decisions
//!
//! Options are matched on a coarse key (name, risk and cost rounded to one
//! decimal). This is a heuristic; a smoother function of the option features
//! would generalize better across similar options.

use super::types::{DecisionOption, DecisionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse identity of an option for pattern matching
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub name: String,
    /// Risk in tenths
    pub risk_bucket: u8,
    /// Cost in tenths
    pub cost_bucket: u8,
}

impl PatternKey {
    pub fn of(option: &DecisionOption) -> Self {
        Self {
            name: option.name.clone(),
            risk_bucket: bucket(option.risk),
            cost_bucket: bucket(option.cost),
        }
    }
}

fn bucket(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 10.0).round() as u8
}

/// Outcome counts for one pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStats {
    pub successes: u32,
    pub failures: u32,
}

impl PatternStats {
    pub fn total(&self) -> u32 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.5,
            total => self.successes as f64 / total as f64,
        }
    }
}

/// Largest score adjustment a pattern can contribute
const MAX_ADJUSTMENT: f64 = 0.2;
/// Samples after which a pattern carries full weight
const FULL_WEIGHT_SAMPLES: f64 = 5.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternBook {
    patterns: HashMap<PatternKey, PatternStats>,
}

impl PatternBook {
    /// Build from executed decisions; unexecuted ones are ignored
    pub fn learn<'a>(decisions: impl IntoIterator<Item = &'a DecisionResult>) -> Self {
        let mut book = Self::default();
        for decision in decisions {
            book.record(decision);
        }
        book
    }

    pub fn record(&mut self, decision: &DecisionResult) {
        let Some(outcome) = &decision.outcome else {
            return;
        };
        let stats = self
            .patterns
            .entry(PatternKey::of(&decision.chosen))
            .or_default();
        if outcome.success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
    }

    pub fn stats(&self, option: &DecisionOption) -> Option<PatternStats> {
        self.patterns.get(&PatternKey::of(option)).copied()
    }

    /// Score adjustment in [-0.2, 0.2]; zero for unseen options
    pub fn adjustment(&self, option: &DecisionOption) -> f64 {
        match self.stats(option) {
            None => 0.0,
            Some(stats) => {
                let weight = (stats.total() as f64 / FULL_WEIGHT_SAMPLES).min(1.0);
                (stats.success_rate() - 0.5) * 2.0 * MAX_ADJUSTMENT * weight
            }
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::{
        ConfidenceLevel, DecisionOutcome, DecisionType,
    };
    use crate::decision::StrategyKind;
    use chrono::Utc;

    fn executed(option: &DecisionOption, success: Option<bool>) -> DecisionResult {
        DecisionResult {
            id: "d".into(),
            decision_type: DecisionType::ErrorRecovery,
            chosen: option.clone(),
            score: 0.5,
            alternatives: Vec::new(),
            rationale: String::new(),
            confidence: ConfidenceLevel::Medium,
            strategy: StrategyKind::Adaptive,
            fallback: false,
            created_at: Utc::now(),
            outcome: success.map(DecisionOutcome::new),
        }
    }

    #[test]
    fn test_keys_round_to_tenths() {
        let a = DecisionOption::new("x", "retry").with_risk(0.31).with_cost(0.19);
        let b = DecisionOption::new("y", "retry").with_risk(0.29).with_cost(0.21);
        assert_eq!(PatternKey::of(&a), PatternKey::of(&b));
    }

    #[test]
    fn test_adjustment_tracks_outcomes() {
        let good = DecisionOption::new("g", "good").with_risk(0.1);
        let bad = DecisionOption::new("b", "bad").with_risk(0.1);
        let history: Vec<DecisionResult> = (0..5)
            .flat_map(|_| [executed(&good, Some(true)), executed(&bad, Some(false))])
            .chain([executed(&good, None)])
            .collect();

        let book = PatternBook::learn(&history);
        assert_eq!(book.len(), 2);
        assert!((book.adjustment(&good) - MAX_ADJUSTMENT).abs() < 1e-9);
        assert!((book.adjustment(&bad) + MAX_ADJUSTMENT).abs() < 1e-9);
        assert_eq!(book.stats(&good).unwrap().total(), 5);
        assert_eq!(book.adjustment(&DecisionOption::new("n", "new")), 0.0);
    }
}
