//! Decision inputs, candidate options and results

use super::strategy::StrategyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kinds of runtime choice the engine makes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    ResourceAllocation,
    TaskRouting,
    ErrorRecovery,
    Scaling,
    Optimization,
    WorkflowAdaptation,
    PriorityAdjustment,
}

impl DecisionType {
    pub const ALL: [DecisionType; 7] = [
        DecisionType::ResourceAllocation,
        DecisionType::TaskRouting,
        DecisionType::ErrorRecovery,
        DecisionType::Scaling,
        DecisionType::Optimization,
        DecisionType::WorkflowAdaptation,
        DecisionType::PriorityAdjustment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionType::ResourceAllocation => "resource_allocation",
            DecisionType::TaskRouting => "task_routing",
            DecisionType::ErrorRecovery => "error_recovery",
            DecisionType::Scaling => "scaling",
            DecisionType::Optimization => "optimization",
            DecisionType::WorkflowAdaptation => "workflow_adaptation",
            DecisionType::PriorityAdjustment => "priority_adjustment",
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether larger or smaller criterion values are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Maximize,
    Minimize,
}

/// One weighted dimension options are judged on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCriterion {
    pub name: String,
    pub weight: f64,
    pub direction: Direction,
    /// Lower bound when maximizing, upper bound when minimizing
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Options beyond the threshold are excluded instead of penalized
    #[serde(default)]
    pub required: bool,
}

impl DecisionCriterion {
    pub fn maximize(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            direction: Direction::Maximize,
            threshold: None,
            required: false,
        }
    }

    pub fn minimize(name: impl Into<String>, weight: f64) -> Self {
        Self {
            direction: Direction::Minimize,
            ..Self::maximize(name, weight)
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Value in [0, 1] where higher is always better
    pub fn normalize(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);
        match self.direction {
            Direction::Maximize => raw,
            Direction::Minimize => 1.0 - raw,
        }
    }

    /// Whether `raw` is on the wrong side of a required threshold
    pub fn violated_by(&self, raw: f64) -> bool {
        match (self.required, self.threshold) {
            (true, Some(threshold)) => match self.direction {
                Direction::Maximize => raw < threshold,
                Direction::Minimize => raw > threshold,
            },
            _ => false,
        }
    }
}

/// Snapshot of the system a decision is made against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Resource figures such as `available_ratio` or `pool_size`
    #[serde(default)]
    pub resource_status: HashMap<String, f64>,
    #[serde(default)]
    pub queue_length: usize,
    /// Recent error descriptions, oldest first
    #[serde(default)]
    pub error_history: Vec<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub constraints: HashMap<String, f64>,
    /// Overall load in [0, 1]
    #[serde(default)]
    pub system_load: f64,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl DecisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_resource_status(mut self, name: impl Into<String>, value: f64) -> Self {
        self.resource_status.insert(name.into(), value);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_history.push(error.into());
        self
    }

    pub fn with_system_load(mut self, load: f64) -> Self {
        self.system_load = load.clamp(0.0, 1.0);
        self
    }

    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Error pressure in [0, 1]; saturates at ten recent errors
    pub fn error_rate(&self) -> f64 {
        (self.error_history.len() as f64 / 10.0).min(1.0)
    }

    /// Time pressure in [0, 1]: 0 without a deadline or with an hour or more
    /// left, 1 once the deadline has passed
    pub fn deadline_pressure(&self, now: DateTime<Utc>) -> f64 {
        match self.deadline {
            None => 0.0,
            Some(deadline) => {
                let remaining = (deadline - now).num_seconds() as f64;
                (1.0 - remaining / 3600.0).clamp(0.0, 1.0)
            }
        }
    }
}

/// A candidate action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub name: String,
    /// Estimated raw value per criterion name, in [0, 1]
    pub impact: BTreeMap<String, f64>,
    pub cost: f64,
    pub risk: f64,
    pub confidence: f64,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            impact: BTreeMap::new(),
            cost: 0.0,
            risk: 0.0,
            confidence: 0.5,
            prerequisites: Vec::new(),
        }
    }

    pub fn with_impact(mut self, criterion: impl Into<String>, value: f64) -> Self {
        self.impact.insert(criterion.into(), value);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Raw value for a criterion; unknown criteria are neutral
    pub fn impact_on(&self, criterion: &str) -> f64 {
        self.impact.get(criterion).copied().unwrap_or(0.5)
    }
}

/// An option with the score a strategy gave it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOption {
    pub option: DecisionOption,
    /// -1 marks an option excluded by a required threshold
    pub score: f64,
}

impl ScoredOption {
    pub fn is_viable(&self) -> bool {
        self.score.is_finite() && self.score > EXCLUDED_SCORE
    }
}

/// Score given to options that violate a required criterion
pub const EXCLUDED_SCORE: f64 = -1.0;

/// Coarse confidence in a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// From the winning score and its margin over the runner-up
    pub fn from_score(score: f64, margin: f64) -> Self {
        if score >= 0.8 && margin >= 0.2 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.6 && margin >= 0.1 {
            ConfidenceLevel::High
        } else if score >= 0.4 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::VeryHigh => "very_high",
        }
    }
}

/// Measured result of carrying out a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub executed_at: DateTime<Utc>,
}

impl DecisionOutcome {
    pub fn new(success: bool) -> Self {
        Self {
            success,
            metrics: BTreeMap::new(),
            executed_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// A decision and, once carried out, its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub id: String,
    pub decision_type: DecisionType,
    pub chosen: DecisionOption,
    pub score: f64,
    /// Remaining options, best first
    pub alternatives: Vec<ScoredOption>,
    pub rationale: String,
    pub confidence: ConfidenceLevel,
    pub strategy: StrategyKind,
    /// No option was viable and a default action was substituted
    pub fallback: bool,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<DecisionOutcome>,
}

impl DecisionResult {
    pub fn is_executed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn succeeded(&self) -> Option<bool> {
        self.outcome.as_ref().map(|o| o.success)
    }
}

/// Aggregate view of the engine's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionStatistics {
    pub total_decisions: usize,
    pub executed: usize,
    pub successful: usize,
    /// Successful over executed
    pub success_rate: f64,
    pub fallbacks: usize,
    pub average_score: f64,
    pub by_type: BTreeMap<String, usize>,
    pub by_confidence: BTreeMap<String, usize>,
    pub current_strategy: StrategyKind,
    pub learned_patterns: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_minimize_criterion_inverts_and_checks_upper_bound() {
        let time = DecisionCriterion::minimize("recovery_time", 0.3)
            .with_threshold(0.5)
            .required();
        assert!((time.normalize(0.2) - 0.8).abs() < 1e-9);
        assert!(time.violated_by(0.7));
        assert!(!time.violated_by(0.4));

        let optional = DecisionCriterion::maximize("success", 1.0).with_threshold(0.9);
        assert!(!optional.violated_by(0.1));
    }

    #[test]
    fn test_deadline_pressure() {
        let now = Utc::now();
        let ctx = DecisionContext::new();
        assert_eq!(ctx.deadline_pressure(now), 0.0);

        let soon = DecisionContext::new().with_deadline(now + Duration::minutes(15));
        assert!((soon.deadline_pressure(now) - 0.75).abs() < 0.01);

        let late = DecisionContext::new().with_deadline(now - Duration::minutes(1));
        assert_eq!(late.deadline_pressure(now), 1.0);
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(ConfidenceLevel::from_score(0.9, 0.3), ConfidenceLevel::VeryHigh);
        assert_eq!(ConfidenceLevel::from_score(0.9, 0.05), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.65, 0.15), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.2, 0.2), ConfidenceLevel::Low);
    }
}
