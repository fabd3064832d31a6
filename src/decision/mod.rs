//! Multi-criteria decision making
//!
//! Each decision type has a default set of weighted criteria and a generator
//! of candidate options. A [`DecisionStrategy`] scores the options, options
//! that violate a required criterion are excluded, and the best one is chosen.
//! Executed decisions feed a pattern book that the adaptive strategy uses to
//! favor options that worked before.

pub mod criteria;
pub mod engine;
pub mod learning;
pub mod options;
pub mod strategy;
pub mod types;

pub use criteria::default_criteria;
pub use engine::{DecisionEngine, DecisionExecutor, SimulatedDecisionExecutor};
pub use learning::{PatternBook, PatternKey, PatternStats};
pub use options::{fallback_option, generate_options};
pub use strategy::{DecisionStrategy, Evaluation, StrategyKind};
pub use types::{
    ConfidenceLevel, DecisionContext, DecisionCriterion, DecisionOption, DecisionOutcome,
    DecisionResult, DecisionStatistics, DecisionType, Direction, ScoredOption,
};
