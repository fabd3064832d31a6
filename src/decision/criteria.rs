//! Default weighted criteria per decision type

use super::types::{DecisionCriterion, DecisionType};

/// Criteria used when a caller does not supply its own; weights sum to 1
pub fn default_criteria(decision_type: DecisionType) -> Vec<DecisionCriterion> {
    use DecisionCriterion as C;
    match decision_type {
        DecisionType::ResourceAllocation => vec![
            C::maximize("efficiency", 0.35),
            C::maximize("availability", 0.25),
            C::minimize("cost", 0.20),
            C::minimize("latency", 0.20),
        ],
        DecisionType::TaskRouting => vec![
            C::maximize("capability_match", 0.40),
            C::maximize("load_balance", 0.30),
            C::minimize("latency", 0.20),
            C::minimize("cost", 0.10),
        ],
        DecisionType::ErrorRecovery => vec![
            C::maximize("success_probability", 0.40),
            C::minimize("recovery_time", 0.30),
            C::maximize("impact_minimization", 0.20),
            C::minimize("cost", 0.10),
        ],
        DecisionType::Scaling => vec![
            C::maximize("performance_gain", 0.35),
            C::minimize("cost", 0.30),
            C::maximize("stability", 0.20),
            C::minimize("response_time", 0.15),
        ],
        DecisionType::Optimization => vec![
            C::maximize("improvement", 0.40),
            C::minimize("effort", 0.25),
            C::maximize("risk_reduction", 0.20),
            C::minimize("cost", 0.15),
        ],
        DecisionType::WorkflowAdaptation => vec![
            C::maximize("throughput", 0.35),
            C::maximize("reliability", 0.35),
            C::minimize("disruption", 0.20),
            C::minimize("cost", 0.10),
        ],
        DecisionType::PriorityAdjustment => vec![
            C::maximize("urgency_alignment", 0.40),
            C::maximize("fairness", 0.25),
            C::minimize("deadline_risk", 0.25),
            C::minimize("disruption", 0.10),
        ],
    }
}
