//! Wave-based pipeline execution

use super::graph::DependencyGraph;
use super::stage::{PipelineContext, PipelineStage};
use crate::config::PipelineConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::retry::{run_with_retry, AttemptError, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Status of one stage within a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Record of one stage within a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: String,
    pub wave: usize,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub retry_count: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StageExecution {
    fn pending(stage: &str, wave: usize) -> Self {
        Self {
            stage: stage.to_string(),
            wave,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            retry_count: 0,
            result: None,
            error: None,
        }
    }
}

/// Terminal status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of [`PipelineManager::execute`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub status: PipelineStatus,
    /// One record per stage, grouped by wave
    pub executions: Vec<StageExecution>,
    /// Waves that started
    pub waves_executed: usize,
    pub total_waves: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn execution(&self, stage: &str) -> Option<&StageExecution> {
        self.executions.iter().find(|e| e.stage == stage)
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.executions.iter().filter(|e| e.status == status).count()
    }
}

/// A validated set of stages ready to execute
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn PipelineStage>>,
    graph: DependencyGraph,
    waves: Vec<Vec<String>>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name())
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("waves", &self.waves)
            .finish()
    }
}

/// Outcome of running one stage through its retry loop
struct StageRun {
    stage: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    attempts: u32,
    result: Result<Value, String>,
    cancelled: bool,
}

/// Builds and runs dependency-ordered pipelines
#[derive(Debug, Clone, Default)]
pub struct PipelineManager {
    config: PipelineConfig,
}

impl PipelineManager {
    /// Fails with `InvalidConfiguration` when `config` does not validate
    pub fn new(config: PipelineConfig) -> OrchestrationResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the stage graph and precompute its waves
    pub fn create_pipeline(
        &self,
        name: impl Into<String>,
        stages: Vec<Arc<dyn PipelineStage>>,
    ) -> OrchestrationResult<Pipeline> {
        let name = name.into();
        let graph = DependencyGraph::build(
            &name,
            stages.iter().map(|s| (s.name(), s.dependencies())),
        )?;
        let waves = graph.waves();
        debug!(
            pipeline = %name,
            stages = stages.len(),
            waves = waves.len(),
            "Created pipeline"
        );
        Ok(Pipeline {
            name,
            stages,
            graph,
            waves,
        })
    }

    /// Run every wave in order, stages within a wave concurrently.
    ///
    /// A stage that fails after exhausting its retries stops new launches in
    /// its wave; stages already running finish, and later waves are skipped.
    pub async fn execute(&self, pipeline: &Pipeline, ctx: PipelineContext) -> PipelineResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let stages: HashMap<&str, Arc<dyn PipelineStage>> = pipeline
            .stages
            .iter()
            .map(|s| (s.name(), Arc::clone(s)))
            .collect();

        let mut executions: Vec<StageExecution> = Vec::with_capacity(pipeline.stages.len());
        let mut position: HashMap<String, usize> = HashMap::new();
        for (wave, names) in pipeline.waves.iter().enumerate() {
            for name in names {
                position.insert(name.clone(), executions.len());
                executions.push(StageExecution::pending(name, wave));
            }
        }

        info!(
            pipeline = %pipeline.name,
            stages = executions.len(),
            waves = pipeline.waves.len(),
            "Executing pipeline"
        );

        let mut failure: Option<OrchestrationError> = None;
        let mut cancelled = false;
        let mut waves_executed = 0;

        for (wave_index, wave) in pipeline.waves.iter().enumerate() {
            if failure.is_some() || cancelled || ctx.is_cancelled() {
                cancelled |= failure.is_none();
                for name in wave {
                    executions[position[name]].status = StageStatus::Skipped;
                }
                continue;
            }
            waves_executed += 1;
            debug!(pipeline = %pipeline.name, wave = wave_index, stages = wave.len(), "Starting wave");

            let mut queue: VecDeque<&String> = wave.iter().collect();
            let mut running = FuturesUnordered::new();
            let mut wave_failed = false;

            loop {
                while !wave_failed
                    && !ctx.is_cancelled()
                    && running.len() < self.config.max_concurrent_stages
                {
                    let Some(name) = queue.pop_front() else {
                        break;
                    };
                    let Some(stage) = stages.get(name.as_str()) else {
                        continue;
                    };
                    let record = &mut executions[position[name]];
                    record.status = StageStatus::Running;
                    record.started_at = Some(Utc::now());

                    let policy = stage
                        .retry_policy()
                        .unwrap_or_else(|| self.config.default_stage_policy());
                    let stage = Arc::clone(stage);
                    let stage_name = name.clone();
                    let stage_ctx = ctx.clone();
                    let label = format!("{}/{}", pipeline.name, name);
                    running.push(async move {
                        match tokio::spawn(run_stage(stage, stage_ctx, policy, label)).await {
                            Ok(run) => run,
                            Err(e) => StageRun {
                                stage: stage_name,
                                started_at: Utc::now(),
                                completed_at: Utc::now(),
                                attempts: 1,
                                result: Err(format!("stage task aborted: {e}")),
                                cancelled: false,
                            },
                        }
                    });
                }

                let Some(run) = running.next().await else {
                    break;
                };

                let record = &mut executions[position[&run.stage]];
                record.attempts = run.attempts;
                record.retry_count = run.attempts.saturating_sub(1);
                record.completed_at = Some(run.completed_at);
                if record.started_at.is_none() {
                    record.started_at = Some(run.started_at);
                }
                match run.result {
                    Ok(value) => {
                        ctx.set_output(&run.stage, value.clone()).await;
                        record.status = StageStatus::Completed;
                        record.result = Some(value);
                        debug!(stage = %run.stage, attempts = run.attempts, "Stage completed");
                    }
                    Err(reason) => {
                        let err = OrchestrationError::StageExecutionFailed {
                            stage: run.stage.clone(),
                            attempts: run.attempts,
                            reason,
                        };
                        record.status = StageStatus::Failed;
                        record.error = Some(err.to_string());
                        if run.cancelled {
                            cancelled = true;
                            warn!(pipeline = %pipeline.name, "{}", err);
                        } else {
                            error!(pipeline = %pipeline.name, "{}", err);
                            wave_failed = true;
                            if failure.is_none() {
                                failure = Some(err);
                            }
                        }
                    }
                }
            }

            for name in queue {
                executions[position[name]].status = StageStatus::Skipped;
            }
            if ctx.is_cancelled() {
                cancelled = true;
            }
        }

        let status = if failure.is_some() {
            PipelineStatus::Failed
        } else if cancelled {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::Completed
        };
        let error = failure
            .map(|e| e.to_string())
            .or_else(|| cancelled.then(|| "pipeline cancelled".to_string()));

        let result = PipelineResult {
            pipeline: pipeline.name.clone(),
            status,
            executions,
            waves_executed,
            total_waves: pipeline.waves.len(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        info!(
            pipeline = %result.pipeline,
            status = ?result.status,
            completed = result.count(StageStatus::Completed),
            failed = result.count(StageStatus::Failed),
            skipped = result.count(StageStatus::Skipped),
            duration_ms = result.duration_ms,
            "Pipeline finished"
        );
        result
    }
}

/// Run a stage under its retry policy, cleaning up after every attempt
async fn run_stage(
    stage: Arc<dyn PipelineStage>,
    ctx: PipelineContext,
    mut policy: RetryPolicy,
    label: String,
) -> StageRun {
    let started_at = Utc::now();
    // The per-attempt limit is applied here so cleanup still runs on timeout
    let attempt_timeout = policy.attempt_timeout.take();

    let outcome = run_with_retry(&policy, Some(ctx.cancellation()), &label, |attempt| {
        let stage = Arc::clone(&stage);
        let ctx = ctx.clone();
        async move {
            debug!(stage = %stage.name(), attempt, "Executing stage attempt");
            let result = match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, stage.execute(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("attempt timed out after {:?}", limit)),
                },
                None => stage.execute(&ctx).await,
            };
            if let Err(e) = stage.cleanup(&ctx).await {
                warn!(stage = %stage.name(), attempt, "Stage cleanup failed: {:#}", e);
            }
            result
        }
    })
    .await;

    StageRun {
        stage: stage.name().to_string(),
        started_at,
        completed_at: Utc::now(),
        attempts: outcome.attempts,
        result: outcome.result.map_err(|e| match e {
            AttemptError::Failed(e) => format!("{e:#}"),
            other => other.to_string(),
        }),
        cancelled: outcome.cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::FnStage;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    fn sleeper(name: &str, millis: u64) -> FnStage {
        let label = name.to_string();
        FnStage::new(name, move |_| {
            let label = label.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!(label))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_diamond_runs_in_three_waves() {
        let manager = PipelineManager::new(fast_config()).unwrap();
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(sleeper("a", 100)),
            Arc::new(sleeper("b", 100).depends_on(["a"])),
            Arc::new(sleeper("c", 100).depends_on(["a"])),
            Arc::new(sleeper("d", 100).depends_on(["b", "c"])),
        ];
        let pipeline = manager.create_pipeline("diamond", stages).unwrap();
        assert_eq!(pipeline.waves().len(), 3);

        let start = tokio::time::Instant::now();
        let result = manager.execute(&pipeline, PipelineContext::new()).await;
        let elapsed = start.elapsed();

        assert!(result.is_success());
        assert_eq!(result.waves_executed, 3);
        assert_eq!(result.count(StageStatus::Completed), 4);
        assert_eq!(result.execution("b").unwrap().wave, 1);
        // b and c overlap, so three stage durations rather than four
        assert!(elapsed < Duration::from_millis(350), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_stage_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counting = |name: &str, dep: &str| {
            let runs = runs.clone();
            Arc::new(
                FnStage::new(name, move |_| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })
                .depends_on([dep]),
            ) as Arc<dyn PipelineStage>
        };

        let manager = PipelineManager::default();
        let err = manager
            .create_pipeline("loop", vec![counting("a", "b"), counting("b", "a")])
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidDependencyGraph { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_flow_to_dependents() {
        let manager = PipelineManager::new(fast_config()).unwrap();
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(FnStage::new("prep", |_| async { Ok(json!({"rows": 3})) })),
            Arc::new(
                FnStage::new("train", |ctx: PipelineContext| async move {
                    let rows = ctx
                        .stage_output("prep")
                        .await
                        .and_then(|v| v["rows"].as_u64())
                        .unwrap_or(0);
                    Ok(json!(rows * 10))
                })
                .depends_on(["prep"]),
            ),
        ];
        let pipeline = manager.create_pipeline("flow", stages).unwrap();
        let ctx = PipelineContext::new();
        let result = manager.execute(&pipeline, ctx.clone()).await;

        assert!(result.is_success());
        assert_eq!(ctx.stage_output("train").await, Some(json!(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_cleanup_after_every_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cleanups = Arc::new(AtomicU32::new(0));
        let stage = {
            let attempts = attempts.clone();
            let cleanups = cleanups.clone();
            FnStage::new("flaky", move |_| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient");
                    }
                    Ok(json!("ok"))
                }
            })
            .with_cleanup(move |_| {
                let cleanups = cleanups.clone();
                async move {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("cleanup errors are not fatal"))
                }
            })
        };

        let manager = PipelineManager::new(fast_config()).unwrap();
        let pipeline = manager
            .create_pipeline("retry", vec![Arc::new(stage) as Arc<dyn PipelineStage>])
            .unwrap();
        let result = manager.execute(&pipeline, PipelineContext::new()).await;

        assert!(result.is_success());
        let record = result.execution("flaky").unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.retry_count, 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_rest_of_wave_and_later_waves() {
        let config = PipelineConfig {
            max_concurrent_stages: 1,
            max_retries: 1,
            retry_delay: Duration::from_millis(5),
            ..PipelineConfig::default()
        };
        let manager = PipelineManager::new(config).unwrap();
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(FnStage::new("broken", |_| async {
                Err::<Value, _>(anyhow::anyhow!("disk full"))
            })),
            Arc::new(sleeper("sibling", 10)),
            Arc::new(sleeper("after", 10).depends_on(["broken", "sibling"])),
        ];
        let pipeline = manager.create_pipeline("failing", stages).unwrap();
        let result = manager.execute(&pipeline, PipelineContext::new()).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        let broken = result.execution("broken").unwrap();
        assert_eq!(broken.status, StageStatus::Failed);
        assert_eq!(broken.attempts, 2);
        assert!(broken.error.as_deref().unwrap().contains("disk full"));
        assert_eq!(result.execution("sibling").unwrap().status, StageStatus::Skipped);
        assert_eq!(result.execution("after").unwrap().status, StageStatus::Skipped);
        assert!(result.error.unwrap().contains("broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_siblings_finish_after_failure() {
        let manager = PipelineManager::new(PipelineConfig {
            max_retries: 0,
            ..fast_config()
        })
        .unwrap();
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(FnStage::new("broken", |_| async {
                Err::<Value, _>(anyhow::anyhow!("boom"))
            })),
            Arc::new(sleeper("slow", 50)),
        ];
        let pipeline = manager.create_pipeline("siblings", stages).unwrap();
        let result = manager.execute(&pipeline, PipelineContext::new()).await;

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.execution("slow").unwrap().status, StageStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_wave_skips_remaining() {
        let manager = PipelineManager::new(fast_config()).unwrap();
        let ctx = PipelineContext::new();
        let cancel_ctx = ctx.clone();
        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(FnStage::new("first", move |_| {
                let ctx = cancel_ctx.clone();
                async move {
                    ctx.cancellation().cancel();
                    Ok(Value::Null)
                }
            })),
            Arc::new(sleeper("second", 10).depends_on(["first"])),
        ];
        let pipeline = manager.create_pipeline("cancel", stages).unwrap();
        let result = manager.execute(&pipeline, ctx).await;

        assert_eq!(result.status, PipelineStatus::Cancelled);
        assert_eq!(result.execution("first").unwrap().status, StageStatus::Completed);
        assert_eq!(result.execution("second").unwrap().status, StageStatus::Skipped);
        assert_eq!(result.waves_executed, 1);
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let manager = PipelineManager::default();
        let pipeline = manager.create_pipeline("empty", Vec::new()).unwrap();
        let result = manager.execute(&pipeline, PipelineContext::new()).await;
        assert!(result.is_success());
        assert_eq!(result.total_waves, 0);
    }

    #[test]
    fn test_zero_stage_concurrency_rejected() {
        let err = PipelineManager::new(PipelineConfig {
            max_concurrent_stages: 0,
            ..fast_config()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidConfiguration { ref field, .. }
                if field == "pipeline.max_concurrent_stages"
        ));
    }
}
