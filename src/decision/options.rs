//! Candidate options per decision type

use super::types::{DecisionContext, DecisionOption, DecisionType};
use chrono::Utc;

/// Static description of a candidate before context adjustment
struct Template {
    id: &'static str,
    name: &'static str,
    impact: &'static [(&'static str, f64)],
    cost: f64,
    risk: f64,
    confidence: f64,
}

const RESOURCE_ALLOCATION: &[Template] = &[
    Template {
        id: "allocate_now",
        name: "Allocate immediately",
        impact: &[("efficiency", 0.7), ("availability", 0.8), ("latency", 0.1)],
        cost: 0.3,
        risk: 0.2,
        confidence: 0.8,
    },
    Template {
        id: "wait_for_capacity",
        name: "Wait for released capacity",
        impact: &[("efficiency", 0.8), ("availability", 0.5), ("latency", 0.6)],
        cost: 0.1,
        risk: 0.1,
        confidence: 0.7,
    },
    Template {
        id: "scale_up_then_allocate",
        name: "Grow the pool, then allocate",
        impact: &[("efficiency", 0.6), ("availability", 0.9), ("latency", 0.4)],
        cost: 0.6,
        risk: 0.25,
        confidence: 0.7,
    },
    Template {
        id: "preempt_low_priority",
        name: "Preempt lower-priority work",
        impact: &[("efficiency", 0.5), ("availability", 0.7), ("latency", 0.2)],
        cost: 0.2,
        risk: 0.5,
        confidence: 0.5,
    },
];

const TASK_ROUTING: &[Template] = &[
    Template {
        id: "capability_match",
        name: "Route by capability",
        impact: &[("capability_match", 0.9), ("load_balance", 0.5), ("latency", 0.3)],
        cost: 0.3,
        risk: 0.15,
        confidence: 0.8,
    },
    Template {
        id: "least_loaded",
        name: "Route to least-loaded agent",
        impact: &[("capability_match", 0.6), ("load_balance", 0.9), ("latency", 0.2)],
        cost: 0.2,
        risk: 0.2,
        confidence: 0.75,
    },
    Template {
        id: "round_robin",
        name: "Round-robin routing",
        impact: &[("capability_match", 0.5), ("load_balance", 0.7), ("latency", 0.1)],
        cost: 0.1,
        risk: 0.3,
        confidence: 0.6,
    },
];

const ERROR_RECOVERY: &[Template] = &[
    Template {
        id: "retry_immediate",
        name: "Retry immediately",
        impact: &[
            ("success_probability", 0.6),
            ("recovery_time", 0.1),
            ("impact_minimization", 0.6),
        ],
        cost: 0.2,
        risk: 0.3,
        confidence: 0.7,
    },
    Template {
        id: "retry_with_backoff",
        name: "Retry with backoff",
        impact: &[
            ("success_probability", 0.75),
            ("recovery_time", 0.3),
            ("impact_minimization", 0.7),
        ],
        cost: 0.25,
        risk: 0.2,
        confidence: 0.8,
    },
    Template {
        id: "fallback_alternative",
        name: "Switch to a fallback path",
        impact: &[
            ("success_probability", 0.65),
            ("recovery_time", 0.4),
            ("impact_minimization", 0.5),
        ],
        cost: 0.4,
        risk: 0.3,
        confidence: 0.6,
    },
    Template {
        id: "skip_task",
        name: "Skip the failed work",
        impact: &[
            ("success_probability", 0.5),
            ("recovery_time", 0.05),
            ("impact_minimization", 0.3),
        ],
        cost: 0.05,
        risk: 0.4,
        confidence: 0.7,
    },
    Template {
        id: "abort",
        name: "Abort remaining work",
        impact: &[
            ("success_probability", 0.2),
            ("recovery_time", 0.0),
            ("impact_minimization", 0.1),
        ],
        cost: 0.0,
        risk: 0.6,
        confidence: 0.9,
    },
];

const SCALING: &[Template] = &[
    Template {
        id: "scale_up",
        name: "Scale up",
        impact: &[("performance_gain", 0.8), ("stability", 0.6), ("response_time", 0.3)],
        cost: 0.7,
        risk: 0.3,
        confidence: 0.7,
    },
    Template {
        id: "scale_down",
        name: "Scale down",
        impact: &[("performance_gain", 0.2), ("stability", 0.6), ("response_time", 0.6)],
        cost: 0.1,
        risk: 0.3,
        confidence: 0.7,
    },
    Template {
        id: "maintain",
        name: "Keep current size",
        impact: &[("performance_gain", 0.4), ("stability", 0.9), ("response_time", 0.5)],
        cost: 0.3,
        risk: 0.1,
        confidence: 0.8,
    },
];

const OPTIMIZATION: &[Template] = &[
    Template {
        id: "tune_parallelism",
        name: "Tune parallelism",
        impact: &[("improvement", 0.6), ("effort", 0.3), ("risk_reduction", 0.4)],
        cost: 0.2,
        risk: 0.3,
        confidence: 0.7,
    },
    Template {
        id: "rebalance_resources",
        name: "Rebalance resources",
        impact: &[("improvement", 0.5), ("effort", 0.4), ("risk_reduction", 0.6)],
        cost: 0.3,
        risk: 0.2,
        confidence: 0.7,
    },
    Template {
        id: "cache_results",
        name: "Cache intermediate results",
        impact: &[("improvement", 0.4), ("effort", 0.2), ("risk_reduction", 0.5)],
        cost: 0.1,
        risk: 0.1,
        confidence: 0.8,
    },
    Template {
        id: "no_change",
        name: "Leave as is",
        impact: &[("improvement", 0.0), ("effort", 0.0), ("risk_reduction", 0.3)],
        cost: 0.0,
        risk: 0.05,
        confidence: 0.9,
    },
];

const WORKFLOW_ADAPTATION: &[Template] = &[
    Template {
        id: "continue_parallel",
        name: "Continue in parallel",
        impact: &[("throughput", 0.9), ("reliability", 0.6), ("disruption", 0.0)],
        cost: 0.3,
        risk: 0.3,
        confidence: 0.7,
    },
    Template {
        id: "switch_sequential",
        name: "Switch to sequential execution",
        impact: &[("throughput", 0.4), ("reliability", 0.9), ("disruption", 0.3)],
        cost: 0.2,
        risk: 0.1,
        confidence: 0.8,
    },
    Template {
        id: "reduce_parallelism",
        name: "Reduce parallelism",
        impact: &[("throughput", 0.6), ("reliability", 0.75), ("disruption", 0.2)],
        cost: 0.25,
        risk: 0.2,
        confidence: 0.75,
    },
];

const PRIORITY_ADJUSTMENT: &[Template] = &[
    Template {
        id: "raise_priority",
        name: "Raise priority",
        impact: &[
            ("urgency_alignment", 0.8),
            ("fairness", 0.4),
            ("deadline_risk", 0.2),
            ("disruption", 0.4),
        ],
        cost: 0.2,
        risk: 0.2,
        confidence: 0.7,
    },
    Template {
        id: "keep_priority",
        name: "Keep priority",
        impact: &[
            ("urgency_alignment", 0.5),
            ("fairness", 0.8),
            ("deadline_risk", 0.5),
            ("disruption", 0.0),
        ],
        cost: 0.0,
        risk: 0.1,
        confidence: 0.8,
    },
    Template {
        id: "lower_priority",
        name: "Lower priority",
        impact: &[
            ("urgency_alignment", 0.2),
            ("fairness", 0.6),
            ("deadline_risk", 0.8),
            ("disruption", 0.2),
        ],
        cost: 0.0,
        risk: 0.3,
        confidence: 0.6,
    },
];

fn templates(decision_type: DecisionType) -> &'static [Template] {
    match decision_type {
        DecisionType::ResourceAllocation => RESOURCE_ALLOCATION,
        DecisionType::TaskRouting => TASK_ROUTING,
        DecisionType::ErrorRecovery => ERROR_RECOVERY,
        DecisionType::Scaling => SCALING,
        DecisionType::Optimization => OPTIMIZATION,
        DecisionType::WorkflowAdaptation => WORKFLOW_ADAPTATION,
        DecisionType::PriorityAdjustment => PRIORITY_ADJUSTMENT,
    }
}

impl Template {
    fn build(&self) -> DecisionOption {
        let mut option = DecisionOption::new(self.id, self.name)
            .with_cost(self.cost)
            .with_risk(self.risk)
            .with_confidence(self.confidence);
        for (criterion, value) in self.impact {
            option.impact.insert((*criterion).to_string(), *value);
        }
        option.impact.entry("cost".to_string()).or_insert(self.cost);
        option
    }
}

/// Candidate options for a decision, adjusted for load, recent errors and
/// deadline pressure
pub fn generate_options(decision_type: DecisionType, ctx: &DecisionContext) -> Vec<DecisionOption> {
    let load = ctx.system_load.clamp(0.0, 1.0);
    let errors = ctx.error_rate();
    let pressure = ctx.deadline_pressure(Utc::now());

    templates(decision_type)
        .iter()
        .map(|template| {
            let mut option = template.build();
            option.risk = (option.risk + 0.1 * errors).clamp(0.0, 1.0);
            option.confidence = (option.confidence - 0.1 * load).clamp(0.0, 1.0);

            match (decision_type, template.id) {
                (DecisionType::ResourceAllocation, "allocate_now") => {
                    bump(&mut option, "availability", -0.4 * load)
                }
                (DecisionType::ResourceAllocation, "wait_for_capacity") => {
                    bump(&mut option, "latency", 0.3 * pressure)
                }
                (DecisionType::ResourceAllocation, "scale_up_then_allocate") => {
                    bump(&mut option, "availability", 0.1 * load)
                }
                (DecisionType::TaskRouting, "least_loaded") => {
                    bump(&mut option, "load_balance", 0.1 * load)
                }
                (DecisionType::ErrorRecovery, "retry_immediate") => {
                    bump(&mut option, "success_probability", -0.3 * errors)
                }
                (DecisionType::ErrorRecovery, "retry_with_backoff") => {
                    bump(&mut option, "recovery_time", 0.2 * pressure)
                }
                (DecisionType::Scaling, "scale_up") => {
                    bump(&mut option, "performance_gain", 0.2 * load)
                }
                (DecisionType::Scaling, "scale_down") => {
                    bump(&mut option, "performance_gain", -0.2 * load);
                    bump(&mut option, "stability", -0.2 * load);
                }
                (DecisionType::Optimization, "tune_parallelism") => {
                    bump(&mut option, "improvement", 0.2 * load)
                }
                (DecisionType::WorkflowAdaptation, "continue_parallel") => {
                    bump(&mut option, "reliability", -0.4 * errors)
                }
                (DecisionType::WorkflowAdaptation, "switch_sequential") => {
                    bump(&mut option, "reliability", 0.1 * errors)
                }
                (DecisionType::PriorityAdjustment, "raise_priority") => {
                    bump(&mut option, "urgency_alignment", 0.2 * pressure)
                }
                (DecisionType::PriorityAdjustment, "keep_priority") => {
                    bump(&mut option, "deadline_risk", 0.3 * pressure)
                }
                _ => {}
            }
            option
        })
        .collect()
}

/// Conservative default used when no option is viable
pub fn fallback_option(decision_type: DecisionType) -> DecisionOption {
    let id = match decision_type {
        DecisionType::ResourceAllocation => "wait_for_capacity",
        DecisionType::TaskRouting => "round_robin",
        DecisionType::ErrorRecovery => "skip_task",
        DecisionType::Scaling => "maintain",
        DecisionType::Optimization => "no_change",
        DecisionType::WorkflowAdaptation => "switch_sequential",
        DecisionType::PriorityAdjustment => "keep_priority",
    };
    let mut option = templates(decision_type)
        .iter()
        .find(|t| t.id == id)
        .map(Template::build)
        .unwrap_or_else(|| DecisionOption::new(id, id));
    option.confidence = 0.3;
    option
}

fn bump(option: &mut DecisionOption, criterion: &str, delta: f64) {
    let value = option.impact_on(criterion);
    option
        .impact
        .insert(criterion.to_string(), (value + delta).clamp(0.0, 1.0));
}
