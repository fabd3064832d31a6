//! Construction-time options for every orchestration component
//!
//! Every struct deserializes with defaults so a partial TOML document (or none
//! at all) yields a usable configuration. Durations use humantime notation
//! (`"30s"`, `"1h"`).

use crate::decision::StrategyKind;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::resource::{ResourceCapacity, ResourceSpec};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
    pub batch: BatchConfig,
    pub decision: DecisionConfig,
    pub workflow: WorkflowConfig,
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> OrchestrationResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| OrchestrationError::invalid_config("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub async fn load(path: impl AsRef<Path>) -> OrchestrationResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        self.pool.validate()?;
        self.pipeline.validate()?;
        self.batch.validate()?;
        self.decision.validate()?;
        self.workflow.validate()
    }
}

/// Options for [`crate::resource::ResourcePool`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub auto_scaling: bool,
    /// Average utilization above which the pool grows
    pub scale_up_threshold: f64,
    /// Average utilization below which idle resources are removed
    pub scale_down_threshold: f64,
    pub scale_up_increment: usize,
    pub scale_down_decrement: usize,
    #[serde(with = "humantime_serde")]
    pub scaling_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Absolute ceiling on how long a single allocation may be held
    #[serde(with = "humantime_serde")]
    pub allocation_timeout: Duration,
    /// Resources whose health drops below this are evicted or put in maintenance
    pub health_threshold: f64,
    /// Capacity given to resources the pool creates
    pub default_capacity: ResourceCapacity,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 4,
            min_pool_size: 2,
            max_pool_size: 16,
            auto_scaling: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_increment: 2,
            scale_down_decrement: 1,
            scaling_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            allocation_timeout: Duration::from_secs(3600),
            health_threshold: 0.5,
            default_capacity: ResourceCapacity::new(4.0, 8192.0, 51_200.0),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.max_pool_size == 0 {
            return Err(OrchestrationError::invalid_config(
                "pool.max_pool_size",
                "must be at least 1",
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(OrchestrationError::invalid_config(
                "pool.min_pool_size",
                format!(
                    "min_pool_size {} exceeds max_pool_size {}",
                    self.min_pool_size, self.max_pool_size
                ),
            ));
        }
        if self.initial_pool_size < self.min_pool_size
            || self.initial_pool_size > self.max_pool_size
        {
            return Err(OrchestrationError::invalid_config(
                "pool.initial_pool_size",
                format!(
                    "{} is outside [{}, {}]",
                    self.initial_pool_size, self.min_pool_size, self.max_pool_size
                ),
            ));
        }
        check_fraction("pool.scale_up_threshold", self.scale_up_threshold)?;
        check_fraction("pool.scale_down_threshold", self.scale_down_threshold)?;
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(OrchestrationError::invalid_config(
                "pool.scale_down_threshold",
                "must be lower than scale_up_threshold",
            ));
        }
        check_fraction("pool.health_threshold", self.health_threshold)?;
        if self.scaling_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(OrchestrationError::invalid_config(
                "pool.scaling_interval",
                "background intervals must be non-zero",
            ));
        }
        if !self.default_capacity.is_positive() {
            return Err(OrchestrationError::invalid_config(
                "pool.default_capacity",
                "every dimension must be positive",
            ));
        }
        Ok(())
    }
}

/// Options for [`crate::pipeline::PipelineManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retries after the first attempt for stages without their own policy
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub backoff_base: f64,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub max_concurrent_stages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            backoff_base: 2.0,
            max_retry_delay: Duration::from_secs(60),
            max_concurrent_stages: 8,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.backoff_base < 1.0 {
            return Err(OrchestrationError::invalid_config(
                "pipeline.backoff_base",
                "must be >= 1.0",
            ));
        }
        if self.max_concurrent_stages == 0 {
            return Err(OrchestrationError::invalid_config(
                "pipeline.max_concurrent_stages",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Policy applied to stages that do not declare one
    pub fn default_stage_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries + 1,
            self.retry_delay,
            self.backoff_base,
            self.max_retry_delay,
        )
    }
}

/// Options for [`crate::batch::BatchProcessor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Global bound on concurrently running tasks
    pub max_parallel: usize,
    /// Bound on concurrently running tasks of one type
    pub max_parallel_per_type: usize,
    /// Total attempts per task, including the first
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub backoff_base: f64,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub task_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub resource_acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Periodic checkpointing is disabled when unset
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Option<Duration>,
    /// Running-task ratio above which the pool is asked to consider scaling
    pub auto_scale_threshold: f64,
    /// Resources requested by tasks that do not declare a spec
    pub default_resource_spec: ResourceSpec,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_parallel_per_type: 2,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            backoff_base: 2.0,
            max_retry_delay: Duration::from_secs(60),
            task_timeout: Some(Duration::from_secs(300)),
            resource_acquire_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_secs(5),
            checkpoint_interval: None,
            auto_scale_threshold: 0.8,
            default_resource_spec: ResourceSpec::new(1.0, 512.0, 1024.0),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.max_parallel == 0 {
            return Err(OrchestrationError::invalid_config(
                "batch.max_parallel",
                "must be at least 1",
            ));
        }
        if self.max_parallel_per_type == 0 {
            return Err(OrchestrationError::invalid_config(
                "batch.max_parallel_per_type",
                "must be at least 1",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(OrchestrationError::invalid_config(
                "batch.retry_attempts",
                "must be at least 1",
            ));
        }
        if self.backoff_base < 1.0 {
            return Err(OrchestrationError::invalid_config(
                "batch.backoff_base",
                "must be >= 1.0",
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(OrchestrationError::invalid_config(
                "batch.progress_interval",
                "must be non-zero",
            ));
        }
        if matches!(self.checkpoint_interval, Some(d) if d.is_zero()) {
            return Err(OrchestrationError::invalid_config(
                "batch.checkpoint_interval",
                "must be non-zero when set",
            ));
        }
        check_fraction("batch.auto_scale_threshold", self.auto_scale_threshold)
    }

    /// Retry policy applied to every task of a batch
    pub fn task_retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::exponential(
            self.retry_attempts,
            self.retry_delay,
            self.backoff_base,
            self.max_retry_delay,
        );
        policy.attempt_timeout = self.task_timeout;
        policy
    }
}

/// Options for [`crate::decision::DecisionEngine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub default_strategy: StrategyKind,
    /// Maximum number of decisions retained in history
    pub history_limit: usize,
    /// Number of recent executed decisions the adaptive strategy learns from
    pub learning_window: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::Utility,
            history_limit: 1000,
            learning_window: 100,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.history_limit == 0 {
            return Err(OrchestrationError::invalid_config(
                "decision.history_limit",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Options for [`crate::workflow::WorkflowExecutor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_parallel_tasks: usize,
    /// Minimum success rate for a workflow to validate
    pub success_threshold: f64,
    /// Failure rate at which adaptive execution falls back to sequential
    pub adaptive_failure_threshold: f64,
    /// Total attempts per workflow task, including the first
    pub task_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub task_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub resource_acquire_timeout: Duration,
    /// Finished workflows kept for `get_status`/`result`; oldest evicted first
    pub max_retained_workflows: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 5,
            success_threshold: 0.8,
            adaptive_failure_threshold: 0.1,
            task_retry_attempts: 2,
            task_retry_delay: Duration::from_millis(500),
            resource_acquire_timeout: Duration::from_secs(30),
            max_retained_workflows: 100,
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.max_parallel_tasks == 0 {
            return Err(OrchestrationError::invalid_config(
                "workflow.max_parallel_tasks",
                "must be at least 1",
            ));
        }
        if self.task_retry_attempts == 0 {
            return Err(OrchestrationError::invalid_config(
                "workflow.task_retry_attempts",
                "must be at least 1",
            ));
        }
        if self.max_retained_workflows == 0 {
            return Err(OrchestrationError::invalid_config(
                "workflow.max_retained_workflows",
                "must be at least 1",
            ));
        }
        check_fraction("workflow.success_threshold", self.success_threshold)?;
        check_fraction(
            "workflow.adaptive_failure_threshold",
            self.adaptive_failure_threshold,
        )
    }

    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.task_retry_attempts,
            self.task_retry_delay,
            2.0,
            Duration::from_secs(30),
        )
    }
}

fn check_fraction(field: &str, value: f64) -> OrchestrationResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(OrchestrationError::invalid_config(
            field,
            format!("{value} is outside (0, 1]"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [pool]
            initial_pool_size = 3
            max_pool_size = 5
            scaling_interval = "2s"

            [batch]
            max_parallel = 8
            checkpoint_interval = "30s"

            [decision]
            default_strategy = "adaptive"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.initial_pool_size, 3);
        assert_eq!(config.pool.max_pool_size, 5);
        assert_eq!(config.pool.min_pool_size, 2);
        assert_eq!(config.pool.scaling_interval, Duration::from_secs(2));
        assert_eq!(config.batch.max_parallel, 8);
        assert_eq!(config.batch.retry_attempts, 3);
        assert_eq!(
            config.batch.checkpoint_interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.decision.default_strategy, StrategyKind::Adaptive);
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [pool]
            initial_pool_size = 3
            min_pool_size = 6
            max_pool_size = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidConfiguration { ref field, .. } if field == "pool.min_pool_size"
        ));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let config = PoolConfig {
            scale_up_threshold: 0.3,
            scale_down_threshold: 0.5,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let config = BatchConfig {
            retry_attempts: 0,
            ..BatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let err = OrchestratorConfig::from_toml_str("[pool\nmax = ").unwrap_err();
        assert_eq!(err.kind(), "invalid_configuration");
    }

    #[test]
    fn test_task_retry_policy_carries_timeout() {
        let config = BatchConfig::default();
        let policy = config.task_retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchflow.toml");
        tokio::fs::write(&path, "[workflow]\nmax_parallel_tasks = 9\n")
            .await
            .unwrap();

        let config = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(config.workflow.max_parallel_tasks, 9);
    }
}
