//! Turns an objective analysis into an execution plan

use super::types::{
    AgentAssignment, Capability, Complexity, ExecutionPlan, ExecutionStrategy, ObjectiveAnalysis,
    RiskAssessment, RiskLevel, TaskGroup,
};
use crate::batch::Task;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Capability count above which coordination becomes a risk factor
const WIDE_PLAN_CAPABILITIES: usize = 4;
const LONG_PLAN: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct WorkflowPlanner;

impl WorkflowPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn create_plan(&self, analysis: &ObjectiveAnalysis) -> ExecutionPlan {
        let strategy = strategy_for(analysis.complexity);
        let per_group = tasks_per_group(analysis.complexity);

        let groups: Vec<TaskGroup> = analysis
            .capabilities
            .iter()
            .enumerate()
            .map(|(index, &capability)| build_group(index, capability, per_group, analysis))
            .collect();

        let mut dependencies = BTreeMap::new();
        for pair in groups.windows(2) {
            dependencies.insert(pair[1].id.clone(), vec![pair[0].id.clone()]);
        }

        let agents = groups
            .iter()
            .map(|group| AgentAssignment {
                agent_id: group.agent_id.clone(),
                capability: group.capability,
                resource_spec: analysis
                    .estimated_resources
                    .clone()
                    .with_estimated_duration(analysis.estimated_duration),
                task_ids: group.tasks.iter().map(|t| t.id.clone()).collect(),
            })
            .collect();

        ExecutionPlan {
            id: format!("plan-{}", Uuid::new_v4()),
            objective: analysis.objective.clone(),
            strategy,
            risk: assess_risk(analysis, strategy),
            groups,
            dependencies,
            agents,
            estimated_duration: analysis.estimated_duration,
            created_at: Utc::now(),
        }
    }
}

pub fn strategy_for(complexity: Complexity) -> ExecutionStrategy {
    match complexity {
        Complexity::Low => ExecutionStrategy::Sequential,
        Complexity::Medium => ExecutionStrategy::Adaptive,
        Complexity::High => ExecutionStrategy::Parallel,
    }
}

fn tasks_per_group(complexity: Complexity) -> usize {
    match complexity {
        Complexity::Low => 1,
        Complexity::Medium => 2,
        Complexity::High => 3,
    }
}

fn build_group(
    index: usize,
    capability: Capability,
    task_count: usize,
    analysis: &ObjectiveAnalysis,
) -> TaskGroup {
    let agent_id = format!("agent-{capability}");
    let tasks = (1..=task_count)
        .map(|step| {
            Task::new(
                format!("{capability}-{step}"),
                capability.as_str(),
                json!({
                    "objective": analysis.objective,
                    "capability": capability,
                    "step": step,
                    "agent": agent_id,
                }),
            )
            .with_resource_spec(analysis.estimated_resources.clone())
        })
        .collect();

    TaskGroup {
        id: format!("group-{}-{capability}", index + 1),
        capability,
        agent_id,
        tasks,
    }
}

fn assess_risk(analysis: &ObjectiveAnalysis, strategy: ExecutionStrategy) -> RiskAssessment {
    let mut factors = Vec::new();
    let mut mitigations = Vec::new();

    if analysis.complexity == Complexity::High {
        factors.push("high objective complexity".to_string());
        mitigations.push("validate each task group before relying on its output".to_string());
    }
    if analysis.capabilities.len() > WIDE_PLAN_CAPABILITIES {
        factors.push(format!(
            "{} capabilities need coordination",
            analysis.capabilities.len()
        ));
        mitigations.push("keep inter-group handoffs small and explicit".to_string());
    }
    if strategy == ExecutionStrategy::Parallel {
        factors.push("parallel groups contend for pool capacity".to_string());
        mitigations.push("allow the pool to auto-scale during execution".to_string());
    }
    if analysis.estimated_duration > LONG_PLAN {
        factors.push("long estimated duration".to_string());
        mitigations.push("checkpoint progress between groups".to_string());
    }

    let level = match factors.len() {
        0 => RiskLevel::Low,
        1 | 2 => RiskLevel::Medium,
        _ => RiskLevel::High,
    };
    RiskAssessment {
        level,
        factors,
        mitigations,
    }
}
