//! Bounded-parallel batch execution with retries and checkpoints

use super::checkpoint::{BatchCheckpoint, CheckpointStore};
use super::progress::{BatchMonitor, MonitorSettings};
use super::stage::{TaskGroupStage, TaskWorker};
use super::state::BatchShared;
use super::types::{BatchResult, BatchStatus, Task, TaskCounts, TaskExecution, TaskStatus};
use crate::config::{BatchConfig, PipelineConfig};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::metrics::MetricsSink;
use crate::pipeline::{PipelineContext, PipelineManager, PipelineStage};
use crate::resource::ResourcePool;
use crate::runner::TaskRunner;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs batches of tasks against a shared resource pool.
///
/// Tasks are grouped by type into pipeline stages, so a cross-type dependency
/// orders whole groups. One batch runs at a time per processor.
pub struct BatchProcessor {
    config: BatchConfig,
    pipeline_config: PipelineConfig,
    pool: Arc<ResourcePool>,
    runner: Arc<dyn TaskRunner>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    shared: Arc<BatchShared>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        pool: Arc<ResourcePool>,
        runner: Arc<dyn TaskRunner>,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        let shared = Arc::new(BatchShared::new(config.max_parallel));
        Ok(Self {
            config,
            pipeline_config: PipelineConfig::default(),
            pool,
            runner,
            checkpoint_store: None,
            metrics: None,
            shared,
        })
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Controls how many task types may run at once
    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> OrchestrationResult<Self> {
        config.validate()?;
        self.pipeline_config = config;
        Ok(self)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run every task to a terminal status.
    ///
    /// Individual task failures are recorded in the result. Only invalid
    /// input and a batch already running on this processor are errors.
    pub async fn process_batch(
        &self,
        tasks: Vec<Task>,
        batch_id: Option<String>,
    ) -> OrchestrationResult<BatchResult> {
        let batch_id = batch_id.unwrap_or_else(|| format!("batch-{}", Uuid::new_v4()));
        let groups = group_by_type(&batch_id, &tasks)?;

        let started = Instant::now();
        let started_at = Utc::now();
        let executions = tasks.iter().cloned().map(TaskExecution::new).collect();
        let _active = self.shared.begin(&batch_id, executions)?;

        let restored = self.restore(&batch_id, &tasks).await;
        info!(
            batch_id = %batch_id,
            tasks = tasks.len(),
            types = groups.len(),
            restored = restored.len(),
            "Processing batch"
        );

        let worker = Arc::new(TaskWorker {
            pool: Arc::clone(&self.pool),
            runner: Arc::clone(&self.runner),
            shared: Arc::clone(&self.shared),
            policy: self.config.task_retry_policy(),
            default_spec: self.config.default_resource_spec.clone(),
            acquire_timeout: self.config.resource_acquire_timeout,
        });
        let stages: Vec<Arc<dyn PipelineStage>> = groups
            .into_iter()
            .map(|group| {
                let pending: Vec<Task> = group
                    .tasks
                    .into_iter()
                    .filter(|t| !restored.contains(&t.id))
                    .collect();
                Arc::new(TaskGroupStage::new(
                    group.task_type,
                    group.dependencies.into_iter().collect(),
                    pending,
                    self.config.max_parallel_per_type,
                    Arc::clone(&worker),
                )) as Arc<dyn PipelineStage>
            })
            .collect();

        let manager = PipelineManager::new(self.pipeline_config.clone())?;
        let pipeline = manager.create_pipeline(batch_id.clone(), stages)?;

        let monitor = BatchMonitor::start(
            MonitorSettings {
                batch_id: batch_id.clone(),
                progress_interval: self.config.progress_interval,
                checkpoint_interval: self.config.checkpoint_interval,
                max_parallel: self.config.max_parallel,
                auto_scale_threshold: self.config.auto_scale_threshold,
            },
            Arc::clone(&self.shared),
            Arc::clone(&self.pool),
            self.checkpoint_store.clone(),
        );

        let ctx = PipelineContext::new().with_cancellation(self.shared.cancel.clone());
        let outcome = manager.execute(&pipeline, ctx).await;
        monitor.stop().await;

        if let Some(err) = &outcome.error {
            if !self.shared.cancel.is_cancelled() {
                error!(batch_id = %batch_id, "Batch pipeline stopped early: {}", err);
            }
            let unstarted = self.shared.settle_unstarted(err);
            if unstarted > 0 {
                debug!(batch_id = %batch_id, unstarted, "Cancelled tasks that never started");
            }
        }

        let executions = self.shared.snapshot();
        self.save_checkpoint(&batch_id, &executions).await;

        let result = self.summarize(batch_id, started, started_at, executions);
        info!(
            batch_id = %result.batch_id,
            completed = result.completed,
            failed = result.failed,
            cancelled = result.cancelled,
            success_rate = result.success_rate,
            duration_ms = result.duration_ms,
            "Batch finished"
        );
        if let Some(sink) = &self.metrics {
            sink.record_batch(&result);
        }
        Ok(result)
    }

    /// Stop starting tasks; returns how many pending tasks were paused
    pub fn pause(&self) -> usize {
        let paused = self.shared.pause();
        info!(batch_id = ?self.shared.batch_id(), paused, "Batch paused");
        paused
    }

    pub fn resume(&self) -> usize {
        let resumed = self.shared.resume();
        info!(batch_id = ?self.shared.batch_id(), resumed, "Batch resumed");
        resumed
    }

    /// Cancel unstarted tasks; running tasks finish normally
    pub fn cancel(&self) -> usize {
        let cancelled = self.shared.cancel();
        info!(batch_id = ?self.shared.batch_id(), cancelled, "Batch cancelled");
        cancelled
    }

    pub fn status(&self) -> BatchStatus {
        self.shared.status()
    }

    /// Copy completed records from the latest checkpoint into the table
    async fn restore(&self, batch_id: &str, tasks: &[Task]) -> HashSet<String> {
        let mut restored = HashSet::new();
        let Some(store) = &self.checkpoint_store else {
            return restored;
        };
        let checkpoint = match store.load(batch_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return restored,
            Err(e) => {
                warn!(batch_id, "Ignoring unreadable checkpoint: {:#}", e);
                return restored;
            }
        };

        let submitted: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        for record in checkpoint.completed() {
            if !submitted.contains(record.task.id.as_str()) {
                continue;
            }
            self.shared.update(&record.task.id, |e| {
                let task = e.task.clone();
                *e = record.clone();
                e.task = task;
                e.restored = true;
            });
            restored.insert(record.task.id.clone());
        }
        debug!(batch_id, restored = restored.len(), "Restored completed tasks from checkpoint");
        restored
    }

    async fn save_checkpoint(&self, batch_id: &str, executions: &[TaskExecution]) {
        let Some(store) = &self.checkpoint_store else {
            return;
        };
        let checkpoint = BatchCheckpoint::new(batch_id, executions.to_vec());
        if let Err(e) = store.save(batch_id, &checkpoint).await {
            let err = OrchestrationError::Checkpoint {
                batch_id: batch_id.to_string(),
                reason: format!("{e:#}"),
            };
            warn!("{}", err);
        }
    }

    fn summarize(
        &self,
        batch_id: String,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
        executions: Vec<TaskExecution>,
    ) -> BatchResult {
        let counts = TaskCounts::tally(&executions);
        let total = executions.len();
        let restored = executions.iter().filter(|e| e.restored).count();

        let mut error_histogram = BTreeMap::new();
        for execution in executions.iter().filter(|e| e.status == TaskStatus::Failed) {
            let kind = execution.error_kind.as_deref().unwrap_or("unknown");
            *error_histogram.entry(kind.to_string()).or_insert(0) += 1;
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        let processed = counts.finished().saturating_sub(restored);
        let pool_status = self.pool.status();

        BatchResult {
            batch_id,
            total,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            restored,
            started_at,
            completed_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            success_rate: if total == 0 {
                0.0
            } else {
                counts.completed as f64 / total as f64
            },
            throughput: if secs > 0.0 { processed as f64 / secs } else { 0.0 },
            resource_utilization: pool_status.average_utilization,
            pool_status,
            error_histogram,
            executions,
        }
    }
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Tasks of one type plus the other types they depend on
struct TaskGroup {
    task_type: String,
    tasks: Vec<Task>,
    dependencies: BTreeSet<String>,
}

/// Group tasks by type in first-seen order and derive group dependencies
fn group_by_type(batch_id: &str, tasks: &[Task]) -> OrchestrationResult<Vec<TaskGroup>> {
    let mut type_of: HashMap<&str, &str> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        if type_of.insert(&task.id, &task.task_type).is_some() {
            return Err(OrchestrationError::invalid_config(
                "tasks",
                format!("duplicate task id {}", task.id),
            ));
        }
    }

    let mut groups: Vec<TaskGroup> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for task in tasks {
        let mut dependencies = BTreeSet::new();
        for dependency in &task.dependencies {
            match type_of.get(dependency.as_str()) {
                None => {
                    return Err(OrchestrationError::InvalidDependencyGraph {
                        pipeline: batch_id.to_string(),
                        reason: format!("task {} depends on unknown task {}", task.id, dependency),
                    })
                }
                Some(&dep_type) if dep_type == task.task_type => {
                    return Err(OrchestrationError::InvalidDependencyGraph {
                        pipeline: batch_id.to_string(),
                        reason: format!(
                            "task {} depends on {} of the same type {}",
                            task.id, dependency, dep_type
                        ),
                    })
                }
                Some(&dep_type) => {
                    dependencies.insert(dep_type.to_string());
                }
            }
        }

        let slot = *index.entry(&task.task_type).or_insert_with(|| {
            groups.push(TaskGroup {
                task_type: task.task_type.clone(),
                tasks: Vec::new(),
                dependencies: BTreeSet::new(),
            });
            groups.len() - 1
        });
        groups[slot].tasks.push(task.clone());
        groups[slot].dependencies.extend(dependencies);
    }
    Ok(groups)
}
