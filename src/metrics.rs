//! Sinks that receive finished batch and workflow results

use crate::batch::BatchResult;
use crate::workflow::WorkflowResult;
use parking_lot::Mutex;
use tracing::info;

/// Downstream consumer of execution results
pub trait MetricsSink: Send + Sync {
    fn record_batch(&self, result: &BatchResult);

    fn record_workflow(&self, result: &WorkflowResult);
}

/// Keeps every result in memory
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    batches: Mutex<Vec<BatchResult>>,
    workflows: Mutex<Vec<WorkflowResult>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BatchResult> {
        self.batches.lock().clone()
    }

    pub fn workflows(&self) -> Vec<WorkflowResult> {
        self.workflows.lock().clone()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_batch(&self, result: &BatchResult) {
        self.batches.lock().push(result.clone());
    }

    fn record_workflow(&self, result: &WorkflowResult) {
        self.workflows.lock().push(result.clone());
    }
}

/// Emits one structured event per result
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_batch(&self, result: &BatchResult) {
        info!(
            target: "benchflow::metrics",
            batch_id = %result.batch_id,
            total = result.total,
            completed = result.completed,
            failed = result.failed,
            cancelled = result.cancelled,
            success_rate = result.success_rate,
            throughput = result.throughput,
            duration_ms = result.duration_ms,
            "batch"
        );
    }

    fn record_workflow(&self, result: &WorkflowResult) {
        info!(
            target: "benchflow::metrics",
            workflow_id = %result.workflow_id,
            status = %result.status,
            completed = result.completed_tasks,
            failed = result.failed_tasks,
            success_rate = result.success_rate,
            duration_ms = result.duration_ms,
            "workflow"
        );
    }
}
