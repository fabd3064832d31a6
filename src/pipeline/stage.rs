//! Pipeline stage abstraction and shared execution context

use crate::cancel::CancellationFlag;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// State shared by every stage of one pipeline run
///
/// Cloning is cheap; clones observe the same outputs and cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    inputs: Arc<HashMap<String, Value>>,
    outputs: Arc<RwLock<HashMap<String, Value>>>,
    cancel: CancellationFlag,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.inputs).insert(key.into(), value);
        self
    }

    /// Share an externally owned cancellation flag
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Result recorded by a completed stage
    pub async fn stage_output(&self, stage: &str) -> Option<Value> {
        self.outputs.read().await.get(stage).cloned()
    }

    pub async fn outputs(&self) -> HashMap<String, Value> {
        self.outputs.read().await.clone()
    }

    pub(crate) async fn set_output(&self, stage: &str, value: Value) {
        self.outputs.write().await.insert(stage.to_string(), value);
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of pipeline work
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    /// Names of stages that must complete first
    fn dependencies(&self) -> &[String];

    /// Stage-specific retry policy; `None` uses the manager default
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    async fn execute(&self, ctx: &PipelineContext) -> anyhow::Result<Value>;

    /// Runs after every attempt, successful or not
    async fn cleanup(&self, _ctx: &PipelineContext) -> anyhow::Result<()> {
        Ok(())
    }
}

type StageBody = Arc<dyn Fn(PipelineContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type CleanupBody = Arc<dyn Fn(PipelineContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Stage backed by an async closure
#[derive(Clone)]
pub struct FnStage {
    name: String,
    dependencies: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    body: StageBody,
    cleanup: Option<CleanupBody>,
}

impl FnStage {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(PipelineContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            retry_policy: None,
            body: Arc::new(move |ctx| Box::pin(body(ctx))),
            cleanup: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: Fn(PipelineContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup = Some(Arc::new(move |ctx| Box::pin(cleanup(ctx))));
        self
    }
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

#[async_trait]
impl PipelineStage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy.clone()
    }

    async fn execute(&self, ctx: &PipelineContext) -> anyhow::Result<Value> {
        (self.body)(ctx.clone()).await
    }

    async fn cleanup(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        match &self.cleanup {
            Some(cleanup) => cleanup(ctx.clone()).await,
            None => Ok(()),
        }
    }
}
