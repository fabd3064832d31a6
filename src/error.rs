//! Structured error types for orchestration operations
//!
//! Only structural failures propagate to callers as `Err`. Transient failures
//! of a single task, stage or decision are absorbed into result records; the
//! variants for those exist so the records can carry a typed description.

use thiserror::Error;

/// Main error type for the orchestration core
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("No resource can satisfy {requested} (pool size {pool_size}, max {max_pool_size})")]
    ResourceUnavailable {
        requested: String,
        pool_size: usize,
        max_pool_size: usize,
    },

    #[error("Invalid dependency graph for pipeline {pipeline}: {reason}")]
    InvalidDependencyGraph { pipeline: String, reason: String },

    #[error("Task {task_id} failed after {attempts} attempt(s): {reason}")]
    TaskExecutionFailed {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Stage {stage} failed after {attempts} attempt(s): {reason}")]
    StageExecutionFailed {
        stage: String,
        attempts: u32,
        reason: String,
    },

    #[error("No viable option for {decision_type} decision: {reason}")]
    NoViableOption {
        decision_type: String,
        reason: String,
    },

    #[error("Allocation {allocation_id} on resource {resource_id} expired after {held_secs}s")]
    AllocationExpired {
        allocation_id: String,
        resource_id: String,
        held_secs: i64,
    },

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Invalid objective: {0}")]
    InvalidObjective(String),

    #[error("Batch {batch_id} is already running on this processor")]
    BatchInProgress { batch_id: String },

    #[error("Unknown decision strategy: {0}")]
    UnknownStrategy(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Checkpoint error for batch {batch_id}: {reason}")]
    Checkpoint { batch_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Stable tag used for error histograms and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::InvalidDependencyGraph { .. } => "invalid_dependency_graph",
            Self::TaskExecutionFailed { .. } => "task_execution_failed",
            Self::StageExecutionFailed { .. } => "stage_execution_failed",
            Self::NoViableOption { .. } => "no_viable_option",
            Self::AllocationExpired { .. } => "allocation_expired",
            Self::InvalidConfiguration { .. } => "invalid_configuration",
            Self::InvalidObjective(_) => "invalid_objective",
            Self::BatchInProgress { .. } => "batch_in_progress",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::Cancelled(_) => "cancelled",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Whether a caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceUnavailable { .. }
                | Self::TaskExecutionFailed { .. }
                | Self::StageExecutionFailed { .. }
                | Self::AllocationExpired { .. }
        )
    }

    pub(crate) fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
