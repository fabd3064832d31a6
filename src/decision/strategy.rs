//! Interchangeable scoring policies over the same option list

use super::learning::PatternBook;
use super::types::{DecisionContext, DecisionCriterion, DecisionOption, ScoredOption, EXCLUDED_SCORE};
use crate::error::OrchestrationError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named decision strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Utility,
    RiskAverse,
    Aggressive,
    Adaptive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Utility,
        StrategyKind::RiskAverse,
        StrategyKind::Aggressive,
        StrategyKind::Adaptive,
    ];

    /// Implementation behind the name
    pub fn strategy(self) -> &'static dyn DecisionStrategy {
        match self {
            StrategyKind::Utility => &UtilityStrategy,
            StrategyKind::RiskAverse => &RiskAverseStrategy,
            StrategyKind::Aggressive => &AggressiveStrategy,
            StrategyKind::Adaptive => &AdaptiveStrategy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Utility => "utility",
            StrategyKind::RiskAverse => "risk_averse",
            StrategyKind::Aggressive => "aggressive",
            StrategyKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "utility" => Ok(Self::Utility),
            "risk_averse" | "conservative" => Ok(Self::RiskAverse),
            "aggressive" => Ok(Self::Aggressive),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(OrchestrationError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Inputs shared by every strategy for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'a> {
    pub criteria: &'a [DecisionCriterion],
    pub context: &'a DecisionContext,
    /// Learned patterns; only the adaptive strategy reads them
    pub patterns: &'a PatternBook,
}

/// A scoring policy
pub trait DecisionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Score for one option; never called for options that violate a
    /// required criterion
    fn score(&self, option: &DecisionOption, eval: &Evaluation<'_>) -> f64;

    /// Score every option, best first
    fn evaluate_options(
        &self,
        options: &[DecisionOption],
        eval: &Evaluation<'_>,
    ) -> Vec<ScoredOption> {
        let mut scored: Vec<ScoredOption> = options
            .iter()
            .map(|option| {
                let score = if violates_required(option, eval.criteria) {
                    EXCLUDED_SCORE
                } else {
                    self.score(option, eval)
                };
                ScoredOption {
                    option: option.clone(),
                    score,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }
}

pub fn violates_required(option: &DecisionOption, criteria: &[DecisionCriterion]) -> bool {
    criteria
        .iter()
        .any(|c| c.violated_by(option.impact_on(&c.name)))
}

/// Weighted mean of direction-adjusted criterion values, in [0, 1]
pub fn weighted_value(option: &DecisionOption, criteria: &[DecisionCriterion]) -> f64 {
    let total_weight: f64 = criteria.iter().map(|c| c.weight.max(0.0)).sum();
    if total_weight <= 0.0 {
        return 0.5;
    }
    criteria
        .iter()
        .map(|c| c.weight.max(0.0) * c.normalize(option.impact_on(&c.name)))
        .sum::<f64>()
        / total_weight
}

/// Weighted value minus a risk penalty plus a confidence bonus
#[derive(Debug, Clone, Copy, Default)]
pub struct UtilityStrategy;

impl DecisionStrategy for UtilityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Utility
    }

    fn score(&self, option: &DecisionOption, eval: &Evaluation<'_>) -> f64 {
        weighted_value(option, eval.criteria) - 0.2 * option.risk + 0.1 * option.confidence
    }
}

/// Conservative baseline; risk is penalized quadratically
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAverseStrategy;

impl DecisionStrategy for RiskAverseStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RiskAverse
    }

    fn score(&self, option: &DecisionOption, eval: &Evaluation<'_>) -> f64 {
        0.3 + 0.3 * weighted_value(option, eval.criteria) - option.risk.powi(2)
            + 0.2 * option.confidence
            + 0.1 * (1.0 - option.cost)
    }
}

/// High baseline plus summed impact with a light risk penalty
#[derive(Debug, Clone, Copy, Default)]
pub struct AggressiveStrategy;

impl DecisionStrategy for AggressiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Aggressive
    }

    fn score(&self, option: &DecisionOption, eval: &Evaluation<'_>) -> f64 {
        let impact: f64 = eval
            .criteria
            .iter()
            .map(|c| c.normalize(option.impact_on(&c.name)))
            .sum();
        0.6 + 0.25 * impact - 0.1 * option.risk
    }
}

/// Utility adjusted by learned patterns, load and time pressure
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveStrategy;

impl DecisionStrategy for AdaptiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn score(&self, option: &DecisionOption, eval: &Evaluation<'_>) -> f64 {
        let base = UtilityStrategy.score(option, eval);
        let learned = eval.patterns.adjustment(option);
        let load = eval.context.system_load.clamp(0.0, 1.0);
        let pressure = eval.context.deadline_pressure(Utc::now());
        base + learned - 0.15 * load * option.cost + 0.1 * pressure * option.confidence
    }
}
