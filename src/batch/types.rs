//! Tasks, per-task execution records and batch results

use crate::resource::{PoolStatus, ResourceSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A discrete unit of work submitted to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Tasks are grouped and concurrency-bounded by type
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Higher runs earlier within its type
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Falls back to the batch default when unset
    #[serde(default)]
    pub resource_spec: Option<ResourceSpec>,
    /// Ids of tasks (of other types) that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-attempt limit overriding the batch default
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            priority: default_priority(),
            resource_spec: None,
            dependencies: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resource_spec(mut self, spec: ResourceSpec) -> Self {
        self.resource_spec = Some(spec);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn default_task_type() -> String {
    "default".to_string()
}

fn default_priority() -> u8 {
    5
}

/// Lifecycle status of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Execution record for one submitted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: Task,
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Resource used by the most recent attempt
    pub resource_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Error histogram key of the final failure
    pub error_kind: Option<String>,
    /// Backoff slept before each retry
    #[serde(default)]
    pub backoff_delays: Vec<Duration>,
    pub duration_ms: Option<u64>,
    /// Completed in an earlier run and restored from a checkpoint
    #[serde(default)]
    pub restored: bool,
}

impl TaskExecution {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            resource_id: None,
            result: None,
            error: None,
            error_kind: None,
            backoff_delays: Vec::new(),
            duration_ms: None,
            restored: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

/// Counts of tasks per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn tally<'a>(executions: impl IntoIterator<Item = &'a TaskExecution>) -> Self {
        let mut counts = Self::default();
        for execution in executions {
            match execution.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Paused => counts.paused += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.completed + self.failed + self.cancelled
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Processor-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Paused,
    Cancelling,
}

/// Live view returned by [`super::BatchProcessor::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: Option<String>,
    pub state: BatchState,
    pub counts: TaskCounts,
}

/// Aggregated outcome of one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed tasks restored from a checkpoint rather than run
    pub restored: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Completed over total
    pub success_rate: f64,
    /// Finished tasks per second of wall-clock time
    pub throughput: f64,
    /// Average pool utilization when the batch ended
    pub resource_utilization: f64,
    pub pool_status: PoolStatus,
    /// Failed task count per error kind
    pub error_histogram: BTreeMap<String, usize>,
    pub executions: Vec<TaskExecution>,
}

impl BatchResult {
    pub fn execution(&self, task_id: &str) -> Option<&TaskExecution> {
        self.executions.iter().find(|e| e.task.id == task_id)
    }
}
