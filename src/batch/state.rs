//! Execution table and control flags shared by a batch's workers

use super::types::{BatchState, BatchStatus, TaskCounts, TaskExecution, TaskStatus};
use crate::cancel::CancellationFlag;
use crate::error::{OrchestrationError, OrchestrationResult};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Active batch's execution records, in submission order
#[derive(Debug, Default)]
struct ExecutionTable {
    batch_id: Option<String>,
    order: Vec<String>,
    executions: HashMap<String, TaskExecution>,
}

/// Result of a worker trying to start its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Started,
    Paused,
    /// The task already reached this status without running
    Settled(TaskStatus),
}

/// State shared between a processor, its task-group stages and workers
#[derive(Debug)]
pub(crate) struct BatchShared {
    table: Mutex<ExecutionTable>,
    pub(crate) cancel: CancellationFlag,
    paused: AtomicBool,
    resumed: Notify,
    /// Global bound on running tasks
    pub(crate) permits: Semaphore,
}

impl BatchShared {
    pub(crate) fn new(max_parallel: usize) -> Self {
        Self {
            table: Mutex::new(ExecutionTable::default()),
            cancel: CancellationFlag::new(),
            paused: AtomicBool::new(false),
            resumed: Notify::new(),
            permits: Semaphore::new(max_parallel.max(1)),
        }
    }

    /// Install a new batch; fails while another is active.
    ///
    /// The returned slot clears the table when dropped.
    pub(crate) fn begin(
        self: &Arc<Self>,
        batch_id: &str,
        executions: Vec<TaskExecution>,
    ) -> OrchestrationResult<ActiveBatch> {
        let mut table = self.table.lock();
        if let Some(active) = &table.batch_id {
            return Err(OrchestrationError::BatchInProgress {
                batch_id: active.clone(),
            });
        }
        table.batch_id = Some(batch_id.to_string());
        table.order = executions.iter().map(|e| e.task.id.clone()).collect();
        table.executions = executions
            .into_iter()
            .map(|e| (e.task.id.clone(), e))
            .collect();
        self.cancel.reset();
        self.paused.store(false, Ordering::SeqCst);
        Ok(ActiveBatch {
            shared: Arc::clone(self),
        })
    }

    pub(crate) fn batch_id(&self) -> Option<String> {
        self.table.lock().batch_id.clone()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.table.lock().executions.get(task_id).map(|e| e.status)
    }

    /// Move a pending task to running
    pub(crate) fn claim(&self, task_id: &str) -> Claim {
        let mut table = self.table.lock();
        let Some(execution) = table.executions.get_mut(task_id) else {
            return Claim::Settled(TaskStatus::Cancelled);
        };
        match execution.status {
            TaskStatus::Pending if self.is_paused() => {
                execution.status = TaskStatus::Paused;
                Claim::Paused
            }
            TaskStatus::Pending => {
                execution.status = TaskStatus::Running;
                execution.started_at = Some(Utc::now());
                Claim::Started
            }
            TaskStatus::Paused => Claim::Paused,
            status => Claim::Settled(status),
        }
    }

    /// Apply `f` to a task's record
    pub(crate) fn update<F>(&self, task_id: &str, f: F)
    where
        F: FnOnce(&mut TaskExecution),
    {
        if let Some(execution) = self.table.lock().executions.get_mut(task_id) {
            f(execution);
        }
    }

    /// Fail a task that never started; returns its resulting status
    pub(crate) fn fail_unstarted(&self, task_id: &str, error: &OrchestrationError) -> TaskStatus {
        let mut table = self.table.lock();
        let Some(execution) = table.executions.get_mut(task_id) else {
            return TaskStatus::Cancelled;
        };
        if matches!(execution.status, TaskStatus::Pending | TaskStatus::Paused) {
            execution.status = TaskStatus::Failed;
            execution.completed_at = Some(Utc::now());
            execution.error = Some(error.to_string());
            execution.error_kind = Some(error.kind().to_string());
        }
        execution.status
    }

    /// Wait until the batch is resumed or cancelled
    pub(crate) async fn wait_while_paused(&self) {
        loop {
            let resumed = self.resumed.notified();
            if !self.is_paused() || self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = resumed => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Stop handing out work; pending tasks become paused
    pub(crate) fn pause(&self) -> usize {
        let mut table = self.table.lock();
        if table.batch_id.is_none() {
            return 0;
        }
        self.paused.store(true, Ordering::SeqCst);
        table
            .executions
            .values_mut()
            .filter(|e| e.status == TaskStatus::Pending)
            .map(|e| e.status = TaskStatus::Paused)
            .count()
    }

    /// Paused tasks become pending again and waiting workers wake
    pub(crate) fn resume(&self) -> usize {
        let resumed = {
            let mut table = self.table.lock();
            self.paused.store(false, Ordering::SeqCst);
            table
                .executions
                .values_mut()
                .filter(|e| e.status == TaskStatus::Paused)
                .map(|e| e.status = TaskStatus::Pending)
                .count()
        };
        self.resumed.notify_waiters();
        resumed
    }

    /// Cancel every task that has not started; running tasks are left alone
    pub(crate) fn cancel(&self) -> usize {
        let cancelled = {
            let mut table = self.table.lock();
            if table.batch_id.is_none() {
                return 0;
            }
            self.cancel.cancel();
            let now = Utc::now();
            table
                .executions
                .values_mut()
                .filter(|e| matches!(e.status, TaskStatus::Pending | TaskStatus::Paused))
                .map(|e| {
                    e.status = TaskStatus::Cancelled;
                    e.completed_at = Some(now);
                })
                .count()
        };
        self.resumed.notify_waiters();
        cancelled
    }

    /// Cancel tasks left unstarted when execution ended early
    pub(crate) fn settle_unstarted(&self, reason: &str) -> usize {
        let mut table = self.table.lock();
        let now = Utc::now();
        table
            .executions
            .values_mut()
            .filter(|e| matches!(e.status, TaskStatus::Pending | TaskStatus::Paused))
            .map(|e| {
                e.status = TaskStatus::Cancelled;
                e.completed_at = Some(now);
                e.error = Some(reason.to_string());
            })
            .count()
    }

    pub(crate) fn counts(&self) -> TaskCounts {
        TaskCounts::tally(self.table.lock().executions.values())
    }

    /// Execution records in submission order
    pub(crate) fn snapshot(&self) -> Vec<TaskExecution> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.executions.get(id).cloned())
            .collect()
    }

    pub(crate) fn status(&self) -> BatchStatus {
        let table = self.table.lock();
        let state = match table.batch_id {
            None => BatchState::Idle,
            Some(_) if self.cancel.is_cancelled() => BatchState::Cancelling,
            Some(_) if self.is_paused() => BatchState::Paused,
            Some(_) => BatchState::Running,
        };
        BatchStatus {
            batch_id: table.batch_id.clone(),
            state,
            counts: TaskCounts::tally(table.executions.values()),
        }
    }
}

/// Marks a batch as active for as long as it is held
#[derive(Debug)]
pub(crate) struct ActiveBatch {
    shared: Arc<BatchShared>,
}

impl Drop for ActiveBatch {
    fn drop(&mut self) {
        let mut table = self.shared.table.lock();
        *table = ExecutionTable::default();
        self.shared.paused.store(false, Ordering::SeqCst);
    }
}
