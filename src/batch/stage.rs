//! Pipeline stage running every task of one type

use super::state::{BatchShared, Claim};
use super::types::{Task, TaskStatus};
use crate::error::OrchestrationError;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::resource::{ResourcePool, ResourceSpec};
use crate::retry::{run_with_retry, AttemptError, RetryPolicy};
use crate::runner::TaskRunner;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything a worker needs to run one task
pub(crate) struct TaskWorker {
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) runner: Arc<dyn TaskRunner>,
    pub(crate) shared: Arc<BatchShared>,
    pub(crate) policy: RetryPolicy,
    pub(crate) default_spec: ResourceSpec,
    pub(crate) acquire_timeout: Duration,
}

impl TaskWorker {
    /// Run one task to a terminal status
    async fn run(&self, task: Task) -> TaskStatus {
        for dependency in &task.dependencies {
            let status = self.shared.status_of(dependency);
            if status != Some(TaskStatus::Completed) {
                let err = OrchestrationError::TaskExecutionFailed {
                    task_id: task.id.clone(),
                    attempts: 0,
                    reason: format!("dependency {dependency} did not complete ({status:?})"),
                };
                warn!(task_id = %task.id, %dependency, "Skipping task with unmet dependency");
                return self.shared.fail_unstarted(&task.id, &err);
            }
        }

        // Hold a global slot before claiming so a queued task stays pending
        let _permit = loop {
            self.shared.wait_while_paused().await;
            let Ok(permit) = self.shared.permits.acquire().await else {
                return self.shared.status_of(&task.id).unwrap_or(TaskStatus::Cancelled);
            };
            match self.shared.claim(&task.id) {
                Claim::Started => break permit,
                Claim::Paused => continue,
                Claim::Settled(status) => return status,
            }
        };

        let mut policy = self.policy.clone();
        if let Some(timeout) = task.timeout {
            policy.attempt_timeout = Some(timeout);
        }
        let spec = task
            .resource_spec
            .clone()
            .unwrap_or_else(|| self.default_spec.clone());
        let started = Instant::now();
        let label = format!("task {}", task.id);

        let (task_ref, spec_ref) = (&task, &spec);
        let outcome = run_with_retry(&policy, Some(&self.shared.cancel), &label, move |attempt| async move {
            let guard = self
                .pool
                .acquire(spec_ref, Some(&task_ref.id), self.acquire_timeout)
                .await?;
            self.shared.update(&task_ref.id, |e| {
                e.attempts = attempt;
                e.resource_id = Some(guard.resource_id().to_string());
            });
            debug!(task_id = %task_ref.id, attempt, resource_id = %guard.resource_id(), "Running task attempt");
            let output = self.runner.run(task_ref).await;
            drop(guard);
            output
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome.result {
            Ok(output) => {
                self.shared.update(&task.id, |e| {
                    e.status = TaskStatus::Completed;
                    e.attempts = outcome.attempts;
                    e.completed_at = Some(Utc::now());
                    e.result = Some(output.result);
                    e.duration_ms = Some(output.duration_ms);
                    e.backoff_delays = outcome.delays;
                });
                debug!(task_id = %task.id, attempts = outcome.attempts, "Task completed");
                TaskStatus::Completed
            }
            Err(err) => {
                let (kind, reason) = match &err {
                    AttemptError::TimedOut(_) => ("timeout", err.to_string()),
                    AttemptError::Failed(e) => (
                        e.downcast_ref::<OrchestrationError>()
                            .map(OrchestrationError::kind)
                            .unwrap_or("task_execution_failed"),
                        format!("{e:#}"),
                    ),
                };
                let failure = OrchestrationError::TaskExecutionFailed {
                    task_id: task.id.clone(),
                    attempts: outcome.attempts,
                    reason,
                };
                if outcome.cancelled {
                    warn!(error_kind = kind, "{} (retries stopped by cancellation)", failure);
                } else {
                    warn!(error_kind = kind, "{}", failure);
                }
                self.shared.update(&task.id, |e| {
                    e.status = TaskStatus::Failed;
                    e.attempts = outcome.attempts;
                    e.completed_at = Some(Utc::now());
                    e.error = Some(failure.to_string());
                    e.error_kind = Some(kind.to_string());
                    e.duration_ms = Some(elapsed_ms);
                    e.backoff_delays = outcome.delays;
                });
                TaskStatus::Failed
            }
        }
    }
}

/// Runs a type's tasks, highest priority first, bounded per type
pub(crate) struct TaskGroupStage {
    task_type: String,
    dependencies: Vec<String>,
    tasks: Vec<Task>,
    max_parallel: usize,
    worker: Arc<TaskWorker>,
}

impl TaskGroupStage {
    pub(crate) fn new(
        task_type: impl Into<String>,
        dependencies: Vec<String>,
        mut tasks: Vec<Task>,
        max_parallel: usize,
        worker: Arc<TaskWorker>,
    ) -> Self {
        // Stable, so equal priorities keep submission order
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            task_type: task_type.into(),
            dependencies,
            tasks,
            max_parallel: max_parallel.max(1),
            worker,
        }
    }
}

#[async_trait]
impl PipelineStage for TaskGroupStage {
    fn name(&self) -> &str {
        &self.task_type
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Tasks retry individually, so the group itself never does
    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::no_retry())
    }

    async fn execute(&self, _ctx: &PipelineContext) -> anyhow::Result<Value> {
        info!(task_type = %self.task_type, tasks = self.tasks.len(), "Starting task group");
        let mut queue: VecDeque<Task> = self.tasks.iter().cloned().collect();
        let mut running = FuturesUnordered::new();
        let (mut completed, mut failed, mut cancelled) = (0usize, 0usize, 0usize);

        loop {
            while running.len() < self.max_parallel {
                let Some(task) = queue.pop_front() else {
                    break;
                };
                let worker = Arc::clone(&self.worker);
                let task_id = task.id.clone();
                running.push(async move {
                    let joined = tokio::spawn(async move { worker.run(task).await }).await;
                    (task_id, joined)
                });
            }

            let Some((task_id, joined)) = running.next().await else {
                break;
            };
            let status = match joined {
                Ok(status) => status,
                Err(e) => {
                    error!(task_id = %task_id, "Task worker aborted: {}", e);
                    self.worker.shared.update(&task_id, |exec| {
                        exec.status = TaskStatus::Failed;
                        exec.completed_at = Some(Utc::now());
                        exec.error = Some(format!("worker aborted: {e}"));
                        exec.error_kind = Some("task_execution_failed".to_string());
                    });
                    TaskStatus::Failed
                }
            };
            match status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Cancelled => cancelled += 1,
                _ => failed += 1,
            }
        }

        info!(
            task_type = %self.task_type,
            completed,
            failed,
            cancelled,
            "Task group finished"
        );
        Ok(json!({
            "task_type": self.task_type,
            "completed": completed,
            "failed": failed,
            "cancelled": cancelled,
        }))
    }
}
