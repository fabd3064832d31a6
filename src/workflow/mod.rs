//! Objective-level orchestration
//!
//! The workflow executor is the entry point for callers with a free-text
//! objective. It classifies the objective, plans capability groups, holds one
//! pool resource per agent while the groups run, and validates the outcome.

pub mod analyzer;
pub mod executor;
pub mod planner;
pub mod types;

pub use analyzer::ObjectiveAnalyzer;
pub use executor::WorkflowExecutor;
pub use planner::WorkflowPlanner;
pub use types::{
    AgentAssignment, AgentPerformance, Capability, Complexity, ExecutionPlan, ExecutionStrategy,
    ExecutorMetrics, ObjectiveAnalysis, ObjectiveType, RiskAssessment, RiskLevel,
    StateTransition, StrategySwitch, TaskGroup, ValidationReport, WorkflowResult, WorkflowState,
    WorkflowStatusReport,
};
