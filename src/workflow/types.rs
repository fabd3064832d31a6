//! Workflow lifecycle, plans and results

use crate::batch::Task;
use crate::resource::ResourceSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle of one workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Planning,
    ResourceAllocation,
    Executing,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Forward transitions only; any live state may fail or be cancelled
    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Created, Planning)
            | (Planning, ResourceAllocation)
            | (ResourceAllocation, Executing)
            | (Executing, Validating)
            | (Validating, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Planning => "planning",
            WorkflowState::ResourceAllocation => "resource_allocation",
            WorkflowState::Executing => "executing",
            WorkflowState::Validating => "validating",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub at: DateTime<Utc>,
}

/// Broad kind of objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    Development,
    Analysis,
    Testing,
    Research,
    Documentation,
    Optimization,
    DataProcessing,
    General,
}

/// Skill an agent brings to a task group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Coding,
    Analysis,
    Testing,
    Research,
    Documentation,
    Optimization,
    DataProcessing,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Coding => "coding",
            Capability::Analysis => "analysis",
            Capability::Testing => "testing",
            Capability::Research => "research",
            Capability::Documentation => "documentation",
            Capability::Optimization => "optimization",
            Capability::DataProcessing => "data_processing",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Low below 0.4, high from 0.7
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Complexity::High
        } else if score >= 0.4 {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveAnalysis {
    pub objective: String,
    pub objective_type: ObjectiveType,
    /// Detected capabilities in a stable order, never empty
    pub capabilities: Vec<Capability>,
    pub complexity_score: f64,
    pub complexity: Complexity,
    #[serde(with = "humantime_serde")]
    pub estimated_duration: Duration,
    /// Capacity each agent should hold
    pub estimated_resources: ResourceSpec,
    /// Matched keywords, for diagnostics
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
    Adaptive,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Adaptive => "adaptive",
        })
    }
}

/// Tasks for one capability, run by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: String,
    pub capability: Capability,
    pub agent_id: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent_id: String,
    pub capability: Capability,
    pub resource_spec: ResourceSpec,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub factors: Vec<String>,
    pub mitigations: Vec<String>,
}

/// Immutable plan for one objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub objective: String,
    pub strategy: ExecutionStrategy,
    pub groups: Vec<TaskGroup>,
    /// Group id to the group ids it follows
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub agents: Vec<AgentAssignment>,
    pub risk: RiskAssessment,
    #[serde(with = "humantime_serde")]
    pub estimated_duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn task_count(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub resource_id: Option<String>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub total_duration_ms: u64,
}

impl AgentPerformance {
    /// Completed over finished; 1.0 for an agent that finished nothing
    pub fn efficiency(&self) -> f64 {
        match self.tasks_completed + self.tasks_failed {
            0 => 1.0,
            finished => self.tasks_completed as f64 / finished as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success_rate: f64,
    pub threshold: f64,
    pub passed: bool,
    pub agent_efficiency: BTreeMap<String, f64>,
    pub resource_utilization: f64,
    pub issues: Vec<String>,
}

/// Adaptive execution fell back from parallel to sequential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySwitch {
    /// Groups finished before the switch
    pub after_groups: usize,
    pub from: ExecutionStrategy,
    pub to: ExecutionStrategy,
    pub failure_rate: f64,
    pub decision_id: String,
}

/// Terminal record of one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub objective: String,
    pub status: WorkflowState,
    pub plan: Option<ExecutionPlan>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub agent_performance: BTreeMap<String, AgentPerformance>,
    pub validation: Option<ValidationReport>,
    pub strategy_switches: Vec<StrategySwitch>,
    /// Ids of decisions consulted during the run
    pub decisions: Vec<String>,
    pub transitions: Vec<StateTransition>,
    pub error: Option<String>,
}

/// Live view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub current_groups: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Totals across every workflow the executor has run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub workflows_started: usize,
    pub workflows_completed: usize,
    pub workflows_failed: usize,
    pub workflows_cancelled: usize,
    pub active_workflows: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub decisions_consulted: usize,
    pub strategy_switches: usize,
    pub average_duration_ms: f64,
    pub average_success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_moves_forward_only() {
        use WorkflowState::*;
        let path = [Created, Planning, ResourceAllocation, Executing, Validating, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]));
        }
        assert!(Executing.can_transition_to(Cancelled));
        assert!(Planning.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_complexity_thresholds() {
        assert_eq!(Complexity::from_score(0.39), Complexity::Low);
        assert_eq!(Complexity::from_score(0.4), Complexity::Medium);
        assert_eq!(Complexity::from_score(0.69), Complexity::Medium);
        assert_eq!(Complexity::from_score(0.7), Complexity::High);
    }

    #[test]
    fn test_agent_efficiency() {
        let mut agent = AgentPerformance::default();
        assert_eq!(agent.efficiency(), 1.0);
        agent.tasks_completed = 3;
        agent.tasks_failed = 1;
        assert_eq!(agent.efficiency(), 0.75);
    }
}
