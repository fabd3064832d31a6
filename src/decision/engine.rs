//! Multi-criteria decision engine with bounded history

use super::criteria::default_criteria;
use super::learning::PatternBook;
use super::options::{fallback_option, generate_options};
use super::strategy::{Evaluation, StrategyKind};
use super::types::{
    ConfidenceLevel, DecisionContext, DecisionCriterion, DecisionOption, DecisionOutcome,
    DecisionResult, DecisionStatistics, DecisionType,
};
use crate::config::DecisionConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Carries out a chosen option and reports what happened
#[async_trait]
pub trait DecisionExecutor: Send + Sync {
    async fn execute(&self, decision: &DecisionResult) -> Result<DecisionOutcome>;
}

/// Succeeds with probability `confidence * (1 - risk)` of the chosen option
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedDecisionExecutor;

#[async_trait]
impl DecisionExecutor for SimulatedDecisionExecutor {
    async fn execute(&self, decision: &DecisionResult) -> Result<DecisionOutcome> {
        let option = &decision.chosen;
        let probability = (option.confidence * (1.0 - option.risk)).clamp(0.0, 1.0);
        let success = rand::rng().random_bool(probability);
        Ok(DecisionOutcome::new(success)
            .with_metric("success_probability", probability)
            .with_metric("score", decision.score))
    }
}

#[derive(Debug, Default)]
struct EngineState {
    strategy: StrategyKind,
    history: VecDeque<DecisionResult>,
    patterns: PatternBook,
}

/// Makes scored decisions and learns from their outcomes.
///
/// Decisions never fail outright: when no option is viable the engine
/// substitutes a low-confidence fallback and says so in the rationale.
pub struct DecisionEngine {
    config: DecisionConfig,
    state: Mutex<EngineState>,
    executor: Arc<dyn DecisionExecutor>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        let state = EngineState {
            strategy: config.default_strategy,
            ..EngineState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
            executor: Arc::new(SimulatedDecisionExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn DecisionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Decide among the generated options for `decision_type`
    pub fn decide(
        &self,
        decision_type: DecisionType,
        ctx: &DecisionContext,
        criteria: Option<Vec<DecisionCriterion>>,
    ) -> DecisionResult {
        let options = generate_options(decision_type, ctx);
        self.decide_with_options(decision_type, ctx, options, criteria)
    }

    /// Decide among caller-supplied options, falling back when none is viable
    pub fn decide_with_options(
        &self,
        decision_type: DecisionType,
        ctx: &DecisionContext,
        options: Vec<DecisionOption>,
        criteria: Option<Vec<DecisionCriterion>>,
    ) -> DecisionResult {
        match self.try_decide_with_options(decision_type, ctx, options, criteria) {
            Ok(result) => result,
            Err(err) => {
                warn!(%decision_type, "{}; using fallback", err);
                let result = self.fallback(decision_type, &err);
                self.push_history(result.clone());
                result
            }
        }
    }

    /// Like [`Self::decide_with_options`] but surfaces `NoViableOption`
    pub fn try_decide_with_options(
        &self,
        decision_type: DecisionType,
        ctx: &DecisionContext,
        options: Vec<DecisionOption>,
        criteria: Option<Vec<DecisionCriterion>>,
    ) -> OrchestrationResult<DecisionResult> {
        let criteria = criteria.unwrap_or_else(|| default_criteria(decision_type));
        if options.is_empty() {
            return Err(OrchestrationError::NoViableOption {
                decision_type: decision_type.to_string(),
                reason: "no candidate options".to_string(),
            });
        }

        let (kind, patterns) = {
            let state = self.state.lock();
            (state.strategy, state.patterns.clone())
        };
        let eval = Evaluation {
            criteria: &criteria,
            context: ctx,
            patterns: &patterns,
        };
        let mut scored = kind.strategy().evaluate_options(&options, &eval);
        let excluded = scored.iter().filter(|s| !s.is_viable()).count();
        if excluded == scored.len() {
            return Err(OrchestrationError::NoViableOption {
                decision_type: decision_type.to_string(),
                reason: format!("all {} option(s) violate a required criterion", excluded),
            });
        }

        let best = scored.remove(0);
        let runner_up = scored.iter().find(|s| s.is_viable()).map(|s| s.score);
        let margin = match runner_up {
            Some(score) => best.score - score,
            None => best.score.max(0.0),
        };
        let confidence = ConfidenceLevel::from_score(best.score, margin);
        let rationale = match scored.iter().find(|s| s.is_viable()) {
            Some(next) => format!(
                "{} strategy chose {} (score {:.3}) over {} by {:.3}",
                kind, best.option.name, best.score, next.option.name, margin
            ),
            None => format!(
                "{} strategy chose {} (score {:.3}), the only viable option",
                kind, best.option.name, best.score
            ),
        };
        let rationale = if excluded > 0 {
            format!("{rationale}; {excluded} option(s) excluded by required criteria")
        } else {
            rationale
        };

        let result = DecisionResult {
            id: Uuid::new_v4().to_string(),
            decision_type,
            chosen: best.option,
            score: best.score,
            alternatives: scored,
            rationale,
            confidence,
            strategy: kind,
            fallback: false,
            created_at: Utc::now(),
            outcome: None,
        };
        debug!(
            decision_id = %result.id,
            %decision_type,
            chosen = %result.chosen.id,
            score = result.score,
            confidence = ?result.confidence,
            "Decision made"
        );
        self.push_history(result.clone());
        Ok(result)
    }

    /// Carry out a decision and record the measured outcome.
    ///
    /// Executor errors count as a failed outcome.
    pub async fn execute(&self, decision: &DecisionResult) -> bool {
        let outcome = match self.executor.execute(decision).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(decision_id = %decision.id, "Decision execution failed: {:#}", e);
                DecisionOutcome::new(false)
            }
        };
        self.record_outcome(decision, outcome)
    }

    /// Attach an outcome measured by the caller; returns its success flag
    pub fn record_outcome(&self, decision: &DecisionResult, outcome: DecisionOutcome) -> bool {
        let success = outcome.success;
        let mut state = self.state.lock();
        match state.history.iter_mut().rev().find(|d| d.id == decision.id) {
            Some(entry) => entry.outcome = Some(outcome),
            None => {
                let mut entry = decision.clone();
                entry.outcome = Some(outcome);
                state.history.push_back(entry);
                trim(&mut state.history, self.config.history_limit);
            }
        }
        if state.strategy == StrategyKind::Adaptive {
            state.patterns = learn_recent(&state.history, self.config.learning_window);
        }
        debug!(decision_id = %decision.id, success, "Recorded decision outcome");
        success
    }

    /// Rebuild learned patterns from `decisions`, or from recent history
    pub fn learn(&self, decisions: Option<&[DecisionResult]>) -> usize {
        let mut state = self.state.lock();
        state.patterns = match decisions {
            Some(decisions) => PatternBook::learn(decisions),
            None => learn_recent(&state.history, self.config.learning_window),
        };
        debug!(patterns = state.patterns.len(), "Learned decision patterns");
        state.patterns.len()
    }

    /// Switch strategy by name; returns the previous one
    pub fn switch_strategy(&self, name: &str) -> OrchestrationResult<StrategyKind> {
        let kind: StrategyKind = name.parse()?;
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.strategy, kind);
        if kind == StrategyKind::Adaptive {
            state.patterns = learn_recent(&state.history, self.config.learning_window);
        }
        info!(from = %previous, to = %kind, "Switched decision strategy");
        Ok(previous)
    }

    pub fn strategy(&self) -> StrategyKind {
        self.state.lock().strategy
    }

    /// Most recent decisions, oldest first
    pub fn history(&self, limit: Option<usize>) -> Vec<DecisionResult> {
        let state = self.state.lock();
        let skip = limit.map_or(0, |limit| state.history.len().saturating_sub(limit));
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> DecisionStatistics {
        let state = self.state.lock();
        let total = state.history.len();
        let executed = state.history.iter().filter(|d| d.is_executed()).count();
        let successful = state
            .history
            .iter()
            .filter(|d| d.succeeded() == Some(true))
            .count();

        let mut by_type = BTreeMap::new();
        let mut by_confidence = BTreeMap::new();
        for decision in &state.history {
            *by_type.entry(decision.decision_type.to_string()).or_insert(0) += 1;
            *by_confidence
                .entry(decision.confidence.as_str().to_string())
                .or_insert(0) += 1;
        }

        DecisionStatistics {
            total_decisions: total,
            executed,
            successful,
            success_rate: if executed == 0 {
                0.0
            } else {
                successful as f64 / executed as f64
            },
            fallbacks: state.history.iter().filter(|d| d.fallback).count(),
            average_score: if total == 0 {
                0.0
            } else {
                state.history.iter().map(|d| d.score).sum::<f64>() / total as f64
            },
            by_type,
            by_confidence,
            current_strategy: state.strategy,
            learned_patterns: state.patterns.len(),
        }
    }

    fn fallback(&self, decision_type: DecisionType, err: &OrchestrationError) -> DecisionResult {
        let chosen = fallback_option(decision_type);
        DecisionResult {
            id: Uuid::new_v4().to_string(),
            decision_type,
            rationale: format!("{err}; falling back to {}", chosen.name),
            chosen,
            score: 0.0,
            alternatives: Vec::new(),
            confidence: ConfidenceLevel::Low,
            strategy: self.strategy(),
            fallback: true,
            created_at: Utc::now(),
            outcome: None,
        }
    }

    fn push_history(&self, result: DecisionResult) {
        let mut state = self.state.lock();
        state.history.push_back(result);
        trim(&mut state.history, self.config.history_limit);
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("strategy", &self.strategy())
            .finish()
    }
}

fn trim(history: &mut VecDeque<DecisionResult>, limit: usize) {
    while history.len() > limit.max(1) {
        history.pop_front();
    }
}

fn learn_recent(history: &VecDeque<DecisionResult>, window: usize) -> PatternBook {
    let executed: Vec<&DecisionResult> = history.iter().filter(|d| d.is_executed()).collect();
    let skip = executed.len().saturating_sub(window);
    PatternBook::learn(executed.into_iter().skip(skip))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedExecutor(bool);

    #[async_trait]
    impl DecisionExecutor for FixedExecutor {
        async fn execute(&self, _decision: &DecisionResult) -> Result<DecisionOutcome> {
            Ok(DecisionOutcome::new(self.0))
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl DecisionExecutor for BrokenExecutor {
        async fn execute(&self, _decision: &DecisionResult) -> Result<DecisionOutcome> {
            anyhow::bail!("executor offline")
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(DecisionConfig::default())
    }

    #[test]
    fn test_decide_every_type() {
        let engine = engine();
        for decision_type in DecisionType::ALL {
            let result = engine.decide(decision_type, &DecisionContext::new(), None);
            assert!(!result.fallback, "{decision_type}");
            assert_eq!(result.decision_type, decision_type);
            assert!(!result.alternatives.is_empty());
        }
        assert_eq!(engine.history(None).len(), DecisionType::ALL.len());
    }

    #[test]
    fn test_single_violating_option_is_never_chosen() {
        let engine = engine();
        let criteria = vec![DecisionCriterion::maximize("success_probability", 1.0)
            .with_threshold(0.8)
            .required()];
        let options = vec![DecisionOption::new("risky", "Risky retry")
            .with_impact("success_probability", 0.3)];

        let err = engine
            .try_decide_with_options(
                DecisionType::ErrorRecovery,
                &DecisionContext::new(),
                options.clone(),
                Some(criteria.clone()),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoViableOption { .. }));

        let result = engine.decide_with_options(
            DecisionType::ErrorRecovery,
            &DecisionContext::new(),
            options,
            Some(criteria),
        );
        assert!(result.fallback);
        assert_ne!(result.chosen.id, "risky");
        assert_eq!(result.confidence, ConfidenceLevel::Low);
        assert!(result.rationale.contains("No viable option"));
    }

    #[test]
    fn test_empty_options_fall_back() {
        let result = engine().decide_with_options(
            DecisionType::Scaling,
            &DecisionContext::new(),
            Vec::new(),
            None,
        );
        assert!(result.fallback);
        assert_eq!(result.chosen.id, "maintain");
    }

    #[tokio::test]
    async fn test_execute_records_outcome_and_adaptive_relearns() {
        let engine = DecisionEngine::new(DecisionConfig {
            default_strategy: StrategyKind::Adaptive,
            ..DecisionConfig::default()
        })
        .with_executor(Arc::new(FixedExecutor(false)));

        let decision = engine.decide(DecisionType::Scaling, &DecisionContext::new(), None);
        assert!(!engine.execute(&decision).await);

        let history = engine.history(Some(1));
        assert_eq!(history[0].succeeded(), Some(false));
        let stats = engine.statistics();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.learned_patterns, 1);
    }

    #[tokio::test]
    async fn test_executor_error_is_a_failed_outcome() {
        let engine = engine().with_executor(Arc::new(BrokenExecutor));
        let decision = engine.decide(DecisionType::Optimization, &DecisionContext::new(), None);
        assert!(!engine.execute(&decision).await);
    }

    #[test]
    fn test_switch_strategy() {
        let engine = engine();
        assert_eq!(engine.switch_strategy("aggressive").unwrap(), StrategyKind::Utility);
        assert_eq!(engine.strategy(), StrategyKind::Aggressive);
        assert!(matches!(
            engine.switch_strategy("coin_flip"),
            Err(OrchestrationError::UnknownStrategy(_))
        ));
        assert_eq!(engine.strategy(), StrategyKind::Aggressive);

        let result = engine.decide(DecisionType::TaskRouting, &DecisionContext::new(), None);
        assert_eq!(result.strategy, StrategyKind::Aggressive);
    }

    #[test]
    fn test_history_is_bounded() {
        let engine = DecisionEngine::new(DecisionConfig {
            history_limit: 3,
            ..DecisionConfig::default()
        });
        for _ in 0..5 {
            engine.decide(DecisionType::Scaling, &DecisionContext::new(), None);
        }
        assert_eq!(engine.history(None).len(), 3);
        assert_eq!(engine.history(Some(2)).len(), 2);
        assert_eq!(engine.statistics().total_decisions, 3);
    }

    #[test]
    fn test_learn_from_supplied_decisions() {
        let engine = engine();
        let mut decision = engine.decide(DecisionType::Scaling, &DecisionContext::new(), None);
        decision.outcome = Some(DecisionOutcome::new(true));
        assert_eq!(engine.learn(Some(std::slice::from_ref(&decision))), 1);
        assert_eq!(engine.learn(None), 0);
    }
}
