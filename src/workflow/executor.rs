//! End-to-end execution of objectives
//!
//! An objective is analyzed, planned, given one pool resource per agent and
//! executed group by group. Failed groups and strategy changes are routed
//! through the decision engine, and the run is validated against the
//! configured success threshold before it completes.

use super::analyzer::ObjectiveAnalyzer;
use super::planner::WorkflowPlanner;
use super::types::{
    AgentPerformance, ExecutionPlan, ExecutionStrategy, ExecutorMetrics, ObjectiveAnalysis,
    StateTransition, StrategySwitch, TaskGroup, ValidationReport, WorkflowResult, WorkflowState,
    WorkflowStatusReport,
};
use crate::batch::{Task, TaskStatus};
use crate::cancel::{sleep_or_cancel, CancellationFlag};
use crate::config::WorkflowConfig;
use crate::decision::{DecisionContext, DecisionEngine, DecisionOutcome, DecisionResult, DecisionType};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::metrics::MetricsSink;
use crate::resource::{ResourceGuard, ResourcePool};
use crate::retry::run_with_retry;
use crate::runner::TaskRunner;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Recent task errors passed to recovery decisions
const RECENT_ERRORS: usize = 10;
/// Agent efficiency below which validation reports an issue
const LOW_AGENT_EFFICIENCY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupFlow {
    Continue,
    Stop,
}

struct RunProgress {
    state: WorkflowState,
    transitions: Vec<StateTransition>,
    tasks: HashMap<String, TaskStatus>,
    agents: BTreeMap<String, AgentPerformance>,
    current_groups: BTreeSet<String>,
    errors: Vec<String>,
    decisions: Vec<String>,
    switches: Vec<StrategySwitch>,
    aborted: Option<String>,
    result: Option<WorkflowResult>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskCounts {
    pending: usize,
    running: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
}

impl TaskCounts {
    fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    fn failure_rate(&self) -> f64 {
        match self.completed + self.failed {
            0 => 0.0,
            finished => self.failed as f64 / finished as f64,
        }
    }
}

impl RunProgress {
    fn new() -> Self {
        Self {
            state: WorkflowState::Created,
            transitions: Vec::new(),
            tasks: HashMap::new(),
            agents: BTreeMap::new(),
            current_groups: BTreeSet::new(),
            errors: Vec::new(),
            decisions: Vec::new(),
            switches: Vec::new(),
            aborted: None,
            result: None,
            updated_at: Utc::now(),
        }
    }

    fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for status in self.tasks.values() {
            match status {
                TaskStatus::Pending | TaskStatus::Paused => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    fn cancel_pending(&mut self) -> usize {
        let mut cancelled = 0;
        for status in self.tasks.values_mut() {
            if matches!(status, TaskStatus::Pending | TaskStatus::Paused) {
                *status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.updated_at = Utc::now();
        }
        cancelled
    }
}

/// Shared state of one workflow run
struct WorkflowRun {
    id: String,
    objective: String,
    started_at: DateTime<Utc>,
    cancel: CancellationFlag,
    slots: Semaphore,
    progress: Mutex<RunProgress>,
}

impl WorkflowRun {
    fn transition(&self, to: WorkflowState) -> bool {
        let mut progress = self.progress.lock();
        let from = progress.state;
        if !from.can_transition_to(to) {
            debug!(workflow_id = %self.id, %from, %to, "Ignoring invalid transition");
            return false;
        }
        let at = Utc::now();
        progress.state = to;
        progress.transitions.push(StateTransition { from, to, at });
        progress.updated_at = at;
        info!(workflow_id = %self.id, %from, %to, "Workflow state changed");
        true
    }

    fn register_plan(&self, plan: &ExecutionPlan) {
        let mut progress = self.progress.lock();
        for group in &plan.groups {
            progress.agents.insert(
                group.agent_id.clone(),
                AgentPerformance {
                    agent_id: group.agent_id.clone(),
                    ..AgentPerformance::default()
                },
            );
            for task in &group.tasks {
                progress.tasks.insert(task.id.clone(), TaskStatus::Pending);
            }
        }
    }

    fn assign_resource(&self, agent_id: &str, resource_id: &str) {
        if let Some(agent) = self.progress.lock().agents.get_mut(agent_id) {
            agent.resource_id = Some(resource_id.to_string());
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.progress.lock().aborted.is_some()
    }

    fn claim(&self, task_id: &str) -> bool {
        let mut progress = self.progress.lock();
        match progress.tasks.get_mut(task_id) {
            Some(status @ TaskStatus::Pending) => {
                *status = TaskStatus::Running;
                progress.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    fn status_of(&self, task_id: &str) -> TaskStatus {
        self.progress
            .lock()
            .tasks
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Cancelled)
    }

    fn finish_task(
        &self,
        task_id: &str,
        agent_id: &str,
        status: TaskStatus,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let mut progress = self.progress.lock();
        progress.tasks.insert(task_id.to_string(), status);
        if let Some(agent) = progress.agents.get_mut(agent_id) {
            agent.total_duration_ms += duration_ms;
            match status {
                TaskStatus::Completed => agent.tasks_completed += 1,
                TaskStatus::Failed => agent.tasks_failed += 1,
                _ => {}
            }
        }
        if let Some(error) = error {
            progress.errors.push(format!("{task_id}: {error}"));
        }
        progress.updated_at = Utc::now();
    }

    /// Put failed tasks back to pending; returns the ids reopened
    fn reopen(&self, agent_id: &str, task_ids: &[String]) -> Vec<String> {
        let mut progress = self.progress.lock();
        let mut reopened = Vec::new();
        for id in task_ids {
            if let Some(status @ TaskStatus::Failed) = progress.tasks.get_mut(id) {
                *status = TaskStatus::Pending;
                reopened.push(id.clone());
            }
        }
        if let Some(agent) = progress.agents.get_mut(agent_id) {
            agent.tasks_failed = agent.tasks_failed.saturating_sub(reopened.len());
        }
        reopened
    }

    fn abort(&self, reason: String) -> usize {
        let mut progress = self.progress.lock();
        progress.aborted.get_or_insert(reason);
        progress.cancel_pending()
    }

    fn counts(&self) -> TaskCounts {
        self.progress.lock().counts()
    }
}

#[derive(Debug, Default)]
struct Totals {
    started: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
    tasks_completed: usize,
    tasks_failed: usize,
    decisions: usize,
    switches: usize,
    finished: usize,
    duration_ms: u64,
    success_rate: f64,
}

/// Top-level orchestrator for objectives
pub struct WorkflowExecutor {
    config: WorkflowConfig,
    pool: Arc<ResourcePool>,
    engine: Arc<DecisionEngine>,
    runner: Arc<dyn TaskRunner>,
    analyzer: ObjectiveAnalyzer,
    planner: WorkflowPlanner,
    metrics: Option<Arc<dyn MetricsSink>>,
    runs: Mutex<HashMap<String, Arc<WorkflowRun>>>,
    totals: Mutex<Totals>,
}

impl WorkflowExecutor {
    pub fn new(
        config: WorkflowConfig,
        pool: Arc<ResourcePool>,
        engine: Arc<DecisionEngine>,
        runner: Arc<dyn TaskRunner>,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            engine,
            runner,
            analyzer: ObjectiveAnalyzer::new(),
            planner: WorkflowPlanner::new(),
            metrics: None,
            runs: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
        })
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    /// Analyze, plan, execute and validate one objective.
    ///
    /// Only an empty objective is an `Err`; failures after that end the
    /// workflow in the `failed` state with partial counts preserved.
    pub async fn execute_objective(&self, objective: &str) -> OrchestrationResult<WorkflowResult> {
        let analysis = self.analyzer.analyze(objective)?;
        let run = self.register(&analysis.objective);
        info!(
            workflow_id = %run.id,
            complexity = ?analysis.complexity,
            capabilities = analysis.capabilities.len(),
            "Starting workflow"
        );

        let mut plan = None;
        let outcome = self.drive(&run, analysis, &mut plan).await;
        Ok(self.finish(&run, plan, outcome))
    }

    /// Live status of a workflow
    pub fn get_status(&self, workflow_id: &str) -> Option<WorkflowStatusReport> {
        let run = self.run(workflow_id)?;
        let progress = run.progress.lock();
        let counts = progress.counts();
        Some(WorkflowStatusReport {
            workflow_id: run.id.clone(),
            state: progress.state,
            total_tasks: counts.total(),
            pending_tasks: counts.pending,
            running_tasks: counts.running,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            cancelled_tasks: counts.cancelled,
            current_groups: progress.current_groups.iter().cloned().collect(),
            updated_at: progress.updated_at,
        })
    }

    /// Final result of a finished workflow
    pub fn result(&self, workflow_id: &str) -> Option<WorkflowResult> {
        self.run(workflow_id)?.progress.lock().result.clone()
    }

    /// Ids of the retained workflows, oldest first
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<(DateTime<Utc>, String)> = self
            .runs
            .lock()
            .values()
            .map(|run| (run.started_at, run.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Cancel pending work of a live workflow; in-flight tasks finish
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let Some(run) = self.run(workflow_id) else {
            return false;
        };
        let cancelled = {
            let mut progress = run.progress.lock();
            if progress.state.is_terminal() {
                return false;
            }
            progress.cancel_pending()
        };
        run.cancel.cancel();
        info!(workflow_id, cancelled_tasks = cancelled, "Cancelling workflow");
        true
    }

    pub fn get_metrics(&self) -> ExecutorMetrics {
        let active = self
            .runs
            .lock()
            .values()
            .filter(|run| !run.progress.lock().state.is_terminal())
            .count();
        let totals = self.totals.lock();
        ExecutorMetrics {
            workflows_started: totals.started,
            workflows_completed: totals.completed,
            workflows_failed: totals.failed,
            workflows_cancelled: totals.cancelled,
            active_workflows: active,
            tasks_completed: totals.tasks_completed,
            tasks_failed: totals.tasks_failed,
            decisions_consulted: totals.decisions,
            strategy_switches: totals.switches,
            average_duration_ms: if totals.finished == 0 {
                0.0
            } else {
                totals.duration_ms as f64 / totals.finished as f64
            },
            average_success_rate: if totals.finished == 0 {
                0.0
            } else {
                totals.success_rate / totals.finished as f64
            },
        }
    }

    fn run(&self, workflow_id: &str) -> Option<Arc<WorkflowRun>> {
        self.runs.lock().get(workflow_id).cloned()
    }

    fn register(&self, objective: &str) -> Arc<WorkflowRun> {
        let run = Arc::new(WorkflowRun {
            id: format!("workflow-{}", Uuid::new_v4()),
            objective: objective.to_string(),
            started_at: Utc::now(),
            cancel: CancellationFlag::new(),
            slots: Semaphore::new(self.config.max_parallel_tasks.max(1)),
            progress: Mutex::new(RunProgress::new()),
        });
        let evicted = {
            let mut runs = self.runs.lock();
            runs.insert(run.id.clone(), Arc::clone(&run));
            evict_finished(&mut runs, self.config.max_retained_workflows)
        };
        if !evicted.is_empty() {
            debug!(evicted = ?evicted, "Evicted finished workflows");
        }
        self.totals.lock().started += 1;
        run
    }

    async fn drive(
        &self,
        run: &WorkflowRun,
        analysis: ObjectiveAnalysis,
        plan_slot: &mut Option<ExecutionPlan>,
    ) -> OrchestrationResult<ValidationReport> {
        run.transition(WorkflowState::Planning);
        let plan = plan_slot.insert(self.planner.create_plan(&analysis));
        run.register_plan(plan);
        debug!(
            workflow_id = %run.id,
            strategy = %plan.strategy,
            groups = plan.groups.len(),
            tasks = plan.task_count(),
            risk = ?plan.risk.level,
            "Created execution plan"
        );
        self.check_cancelled(run)?;

        run.transition(WorkflowState::ResourceAllocation);
        let agents = self.allocate_agents(run, plan).await?;
        self.check_cancelled(run)?;

        run.transition(WorkflowState::Executing);
        self.execute_plan(run, plan).await;
        let utilization = self.pool.status().average_utilization;
        drop(agents);

        self.check_cancelled(run)?;
        if let Some(reason) = run.progress.lock().aborted.clone() {
            return Err(OrchestrationError::Cancelled(reason));
        }

        run.transition(WorkflowState::Validating);
        Ok(self.validate(run, utilization))
    }

    fn check_cancelled(&self, run: &WorkflowRun) -> OrchestrationResult<()> {
        if run.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled(format!("workflow {}", run.id)));
        }
        Ok(())
    }

    /// One resource per agent; a failed acquisition consults the engine and
    /// is retried once
    async fn allocate_agents(
        &self,
        run: &WorkflowRun,
        plan: &ExecutionPlan,
    ) -> OrchestrationResult<Vec<ResourceGuard>> {
        let timeout = self.config.resource_acquire_timeout;
        let mut guards = Vec::with_capacity(plan.agents.len());

        for agent in &plan.agents {
            let owner = format!("{}/{}", run.id, agent.agent_id);
            let first = tokio::select! {
                acquired = self.pool.acquire(&agent.resource_spec, Some(&owner), timeout) => acquired,
                _ = run.cancel.cancelled() => {
                    return Err(OrchestrationError::Cancelled(format!("workflow {}", run.id)));
                }
            };

            let guard = match first {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(
                        workflow_id = %run.id,
                        agent = %agent.agent_id,
                        "Resource acquisition failed: {}",
                        err
                    );
                    let ctx = self
                        .decision_context(run)
                        .with_error(err.to_string())
                        .with_queue_length(plan.agents.len() - guards.len());
                    let decision = self.consult(run, DecisionType::ResourceAllocation, &ctx);
                    if decision.chosen.id == "scale_up_then_allocate" {
                        let added = self.pool.scale_up(self.pool.config().scale_up_increment);
                        debug!(workflow_id = %run.id, added, "Scaled pool before retrying");
                    }

                    let retried = tokio::select! {
                        acquired = self.pool.acquire(&agent.resource_spec, Some(&owner), timeout) => acquired,
                        _ = run.cancel.cancelled() => {
                            return Err(OrchestrationError::Cancelled(format!("workflow {}", run.id)));
                        }
                    };
                    self.engine
                        .record_outcome(&decision, DecisionOutcome::new(retried.is_ok()));
                    retried?
                }
            };

            run.assign_resource(&agent.agent_id, guard.resource_id());
            debug!(
                workflow_id = %run.id,
                agent = %agent.agent_id,
                resource_id = %guard.resource_id(),
                "Agent resource acquired"
            );
            guards.push(guard);
        }
        Ok(guards)
    }

    async fn execute_plan(&self, run: &WorkflowRun, plan: &ExecutionPlan) {
        match plan.strategy {
            ExecutionStrategy::Sequential => {
                for group in &plan.groups {
                    if self.run_group(run, group, false).await == GroupFlow::Stop {
                        break;
                    }
                }
            }
            ExecutionStrategy::Parallel => {
                join_all(plan.groups.iter().map(|group| self.run_group(run, group, true))).await;
            }
            ExecutionStrategy::Adaptive => self.run_adaptive(run, plan).await,
        }
    }

    /// Chunks of groups in parallel until the failure rate reaches the
    /// threshold, then one group at a time
    async fn run_adaptive(&self, run: &WorkflowRun, plan: &ExecutionPlan) {
        let per_group = plan.groups.iter().map(|g| g.tasks.len()).max().unwrap_or(1);
        let chunk = (self.config.max_parallel_tasks / per_group.max(1)).max(1);
        let mut switch: Option<(DecisionResult, TaskCounts)> = None;
        let mut index = 0;

        while index < plan.groups.len() && !run.should_stop() {
            if switch.is_none() {
                let end = (index + chunk).min(plan.groups.len());
                let flows = join_all(
                    plan.groups[index..end]
                        .iter()
                        .map(|group| self.run_group(run, group, true)),
                )
                .await;
                index = end;
                if flows.contains(&GroupFlow::Stop) {
                    break;
                }

                let counts = run.counts();
                let rate = counts.failure_rate();
                if rate >= self.config.adaptive_failure_threshold && index < plan.groups.len() {
                    let ctx = self
                        .decision_context(run)
                        .with_metric("failure_rate", rate)
                        .with_queue_length(counts.pending);
                    let decision = self.consult(run, DecisionType::WorkflowAdaptation, &ctx);
                    warn!(
                        workflow_id = %run.id,
                        failure_rate = rate,
                        after_groups = index,
                        "Switching from parallel to sequential execution"
                    );
                    run.progress.lock().switches.push(StrategySwitch {
                        after_groups: index,
                        from: ExecutionStrategy::Parallel,
                        to: ExecutionStrategy::Sequential,
                        failure_rate: rate,
                        decision_id: decision.id.clone(),
                    });
                    switch = Some((decision, counts));
                }
            } else {
                let flow = self.run_group(run, &plan.groups[index], false).await;
                index += 1;
                if flow == GroupFlow::Stop {
                    break;
                }
            }
        }

        if let Some((decision, before)) = switch {
            let after = run.counts();
            let completed = after.completed.saturating_sub(before.completed);
            let failed = after.failed.saturating_sub(before.failed);
            let rate = match completed + failed {
                0 => 0.0,
                finished => failed as f64 / finished as f64,
            };
            self.engine.record_outcome(
                &decision,
                DecisionOutcome::new(rate < self.config.adaptive_failure_threshold)
                    .with_metric("failure_rate_after_switch", rate),
            );
        }
    }

    async fn run_group(&self, run: &WorkflowRun, group: &TaskGroup, concurrent: bool) -> GroupFlow {
        if run.should_stop() {
            return GroupFlow::Stop;
        }
        run.progress.lock().current_groups.insert(group.id.clone());
        debug!(workflow_id = %run.id, group = %group.id, concurrent, "Starting task group");

        let tasks: Vec<&Task> = group.tasks.iter().collect();
        let statuses = self.run_tasks(run, group, &tasks, concurrent).await;
        let failed: Vec<String> = statuses
            .into_iter()
            .filter(|(_, status)| *status == TaskStatus::Failed)
            .map(|(id, _)| id)
            .collect();

        let flow = if failed.is_empty() || run.cancel.is_cancelled() {
            GroupFlow::Continue
        } else {
            self.recover(run, group, failed, concurrent).await
        };
        run.progress.lock().current_groups.remove(&group.id);
        if run.should_stop() {
            GroupFlow::Stop
        } else {
            flow
        }
    }

    async fn run_tasks(
        &self,
        run: &WorkflowRun,
        group: &TaskGroup,
        tasks: &[&Task],
        concurrent: bool,
    ) -> Vec<(String, TaskStatus)> {
        if concurrent {
            join_all(tasks.iter().map(|task| async move {
                (task.id.clone(), self.run_task(run, group, task).await)
            }))
            .await
        } else {
            let mut statuses = Vec::with_capacity(tasks.len());
            for task in tasks {
                if run.should_stop() {
                    break;
                }
                statuses.push((task.id.clone(), self.run_task(run, group, task).await));
            }
            statuses
        }
    }

    async fn run_task(&self, run: &WorkflowRun, group: &TaskGroup, task: &Task) -> TaskStatus {
        let Ok(_permit) = run.slots.acquire().await else {
            return run.status_of(&task.id);
        };
        if !run.claim(&task.id) {
            return run.status_of(&task.id);
        }

        let started = std::time::Instant::now();
        let policy = self.config.task_retry_policy();
        let label = format!("workflow task {}", task.id);
        let runner = &self.runner;
        let attempts = AssertUnwindSafe(run_with_retry(
            &policy,
            Some(&run.cancel),
            &label,
            move |_attempt| runner.run(task),
        ))
        .catch_unwind()
        .await;

        let outcome = match attempts {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = format!("worker aborted: {}", panic_message(panic.as_ref()));
                error!(workflow_id = %run.id, task_id = %task.id, "Workflow task {}", reason);
                let elapsed = started.elapsed().as_millis() as u64;
                run.finish_task(&task.id, &group.agent_id, TaskStatus::Failed, elapsed, Some(reason));
                return TaskStatus::Failed;
            }
        };

        match outcome.result {
            Ok(output) => {
                run.finish_task(&task.id, &group.agent_id, TaskStatus::Completed, output.duration_ms, None);
                debug!(
                    workflow_id = %run.id,
                    task_id = %task.id,
                    attempts = outcome.attempts,
                    "Workflow task completed"
                );
                TaskStatus::Completed
            }
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                warn!(
                    workflow_id = %run.id,
                    task_id = %task.id,
                    attempts = outcome.attempts,
                    "Workflow task failed: {}",
                    err
                );
                run.finish_task(
                    &task.id,
                    &group.agent_id,
                    TaskStatus::Failed,
                    elapsed,
                    Some(err.to_string()),
                );
                TaskStatus::Failed
            }
        }
    }

    /// Ask the engine how to handle failed tasks and report how it went
    async fn recover(
        &self,
        run: &WorkflowRun,
        group: &TaskGroup,
        failed: Vec<String>,
        concurrent: bool,
    ) -> GroupFlow {
        let ctx = self
            .decision_context(run)
            .with_metric("failed_tasks", failed.len() as f64)
            .with_metric("group_size", group.tasks.len() as f64);
        let decision = self.consult(run, DecisionType::ErrorRecovery, &ctx);
        info!(
            workflow_id = %run.id,
            group = %group.id,
            failed = failed.len(),
            action = %decision.chosen.id,
            "Recovering failed tasks"
        );

        let (flow, recovered) = match decision.chosen.id.as_str() {
            "retry_immediate" | "retry_with_backoff" | "fallback_alternative" => {
                let waited = decision.chosen.id != "retry_with_backoff"
                    || sleep_or_cancel(Some(&run.cancel), self.config.task_retry_delay).await;
                if waited {
                    let reopened = run.reopen(&group.agent_id, &failed);
                    let tasks: Vec<&Task> = group
                        .tasks
                        .iter()
                        .filter(|t| reopened.contains(&t.id))
                        .collect();
                    let statuses = self.run_tasks(run, group, &tasks, concurrent).await;
                    let recovered = statuses
                        .iter()
                        .filter(|(_, status)| *status == TaskStatus::Completed)
                        .count();
                    (GroupFlow::Continue, recovered)
                } else {
                    (GroupFlow::Continue, 0)
                }
            }
            "abort" => {
                let reason = format!(
                    "aborted after {} failed task(s) in {}",
                    failed.len(),
                    group.id
                );
                let cancelled = run.abort(reason);
                warn!(workflow_id = %run.id, cancelled_tasks = cancelled, "Aborting workflow");
                (GroupFlow::Stop, 0)
            }
            _ => (GroupFlow::Continue, 0),
        };

        self.engine.record_outcome(
            &decision,
            DecisionOutcome::new(recovered == failed.len())
                .with_metric("failed_tasks", failed.len() as f64)
                .with_metric("recovered_tasks", recovered as f64),
        );
        flow
    }

    fn consult(&self, run: &WorkflowRun, decision_type: DecisionType, ctx: &DecisionContext) -> DecisionResult {
        let decision = self.engine.decide(decision_type, ctx, None);
        run.progress.lock().decisions.push(decision.id.clone());
        debug!(
            workflow_id = %run.id,
            %decision_type,
            chosen = %decision.chosen.id,
            fallback = decision.fallback,
            "Consulted decision engine"
        );
        decision
    }

    fn decision_context(&self, run: &WorkflowRun) -> DecisionContext {
        let utilization = self.pool.status().average_utilization;
        let (counts, errors) = {
            let progress = run.progress.lock();
            let skip = progress.errors.len().saturating_sub(RECENT_ERRORS);
            (progress.counts(), progress.errors[skip..].to_vec())
        };
        errors.into_iter().fold(
            DecisionContext::new()
                .with_system_load(utilization)
                .with_resource_status("utilization", utilization)
                .with_metric("failure_rate", counts.failure_rate())
                .with_queue_length(counts.pending),
            |ctx, error| ctx.with_error(error),
        )
    }

    fn validate(&self, run: &WorkflowRun, resource_utilization: f64) -> ValidationReport {
        let progress = run.progress.lock();
        let counts = progress.counts();
        let success_rate = match counts.total() {
            0 => 0.0,
            total => counts.completed as f64 / total as f64,
        };
        let threshold = self.config.success_threshold;
        let passed = success_rate >= threshold;

        let agent_efficiency: BTreeMap<String, f64> = progress
            .agents
            .iter()
            .map(|(id, agent)| (id.clone(), agent.efficiency()))
            .collect();

        let mut issues = Vec::new();
        if !passed {
            issues.push(format!(
                "success rate {success_rate:.2} is below the threshold {threshold:.2}"
            ));
        }
        for (agent, efficiency) in &agent_efficiency {
            if *efficiency < LOW_AGENT_EFFICIENCY {
                issues.push(format!("{agent} efficiency is {efficiency:.2}"));
            }
        }

        ValidationReport {
            success_rate,
            threshold,
            passed,
            agent_efficiency,
            resource_utilization,
            issues,
        }
    }

    fn finish(
        &self,
        run: &WorkflowRun,
        plan: Option<ExecutionPlan>,
        outcome: OrchestrationResult<ValidationReport>,
    ) -> WorkflowResult {
        let (state, validation, error) = match outcome {
            Ok(report) if report.passed => (WorkflowState::Completed, Some(report), None),
            Ok(report) => {
                let reason = format!(
                    "validation failed: {}",
                    report.issues.first().cloned().unwrap_or_default()
                );
                (WorkflowState::Failed, Some(report), Some(reason))
            }
            Err(OrchestrationError::Cancelled(_)) if run.cancel.is_cancelled() => {
                (WorkflowState::Cancelled, None, None)
            }
            Err(OrchestrationError::Cancelled(reason)) => (WorkflowState::Failed, None, Some(reason)),
            Err(err) => {
                error!(workflow_id = %run.id, "Workflow failed: {}", err);
                (WorkflowState::Failed, None, Some(err.to_string()))
            }
        };
        run.transition(state);

        let completed_at = Utc::now();
        let result = {
            let mut progress = run.progress.lock();
            progress.cancel_pending();
            progress.current_groups.clear();
            let counts = progress.counts();
            let result = WorkflowResult {
                workflow_id: run.id.clone(),
                objective: run.objective.clone(),
                status: progress.state,
                plan,
                total_tasks: counts.total(),
                completed_tasks: counts.completed,
                failed_tasks: counts.failed,
                cancelled_tasks: counts.cancelled,
                success_rate: match counts.total() {
                    0 => 0.0,
                    total => counts.completed as f64 / total as f64,
                },
                started_at: run.started_at,
                completed_at,
                duration_ms: (completed_at - run.started_at).num_milliseconds().max(0) as u64,
                agent_performance: progress.agents.clone(),
                validation,
                strategy_switches: progress.switches.clone(),
                decisions: progress.decisions.clone(),
                transitions: progress.transitions.clone(),
                error,
            };
            progress.result = Some(result.clone());
            result
        };

        {
            let mut totals = self.totals.lock();
            match result.status {
                WorkflowState::Completed => totals.completed += 1,
                WorkflowState::Cancelled => totals.cancelled += 1,
                _ => totals.failed += 1,
            }
            totals.tasks_completed += result.completed_tasks;
            totals.tasks_failed += result.failed_tasks;
            totals.decisions += result.decisions.len();
            totals.switches += result.strategy_switches.len();
            totals.finished += 1;
            totals.duration_ms += result.duration_ms;
            totals.success_rate += result.success_rate;
        }

        info!(
            workflow_id = %result.workflow_id,
            status = %result.status,
            completed = result.completed_tasks,
            failed = result.failed_tasks,
            cancelled = result.cancelled_tasks,
            duration_ms = result.duration_ms,
            "Workflow finished"
        );
        if let Some(sink) = &self.metrics {
            sink.record_workflow(&result);
        }
        result
    }
}

/// Drop the oldest finished runs until at most `limit` remain; live runs
/// are never evicted
fn evict_finished(runs: &mut HashMap<String, Arc<WorkflowRun>>, limit: usize) -> Vec<String> {
    let excess = runs.len().saturating_sub(limit);
    if excess == 0 {
        return Vec::new();
    }
    let mut finished: Vec<(DateTime<Utc>, String)> = runs
        .values()
        .filter(|run| run.progress.lock().state.is_terminal())
        .map(|run| (run.started_at, run.id.clone()))
        .collect();
    finished.sort();
    finished
        .into_iter()
        .take(excess)
        .map(|(_, id)| {
            runs.remove(&id);
            id
        })
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "task runner panicked"
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("config", &self.config)
            .field("workflows", &self.runs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecisionConfig, PoolConfig};
    use crate::metrics::InMemoryMetricsSink;
    use crate::runner::FnRunner;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const HIGH: &str = "Build a distributed, scalable system with security testing, \
                        performance tuning and full documentation across multiple services";

    fn pool() -> Arc<ResourcePool> {
        Arc::new(ResourcePool::new(PoolConfig::default()).unwrap())
    }

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            task_retry_attempts: 1,
            task_retry_delay: Duration::from_millis(1),
            resource_acquire_timeout: Duration::from_millis(50),
            ..WorkflowConfig::default()
        }
    }

    fn executor(runner: Arc<dyn TaskRunner>) -> WorkflowExecutor {
        WorkflowExecutor::new(
            config(),
            pool(),
            Arc::new(DecisionEngine::new(DecisionConfig::default())),
            runner,
        )
        .unwrap()
    }

    fn succeeding() -> Arc<dyn TaskRunner> {
        Arc::new(FnRunner::new(|task: Task| async move { Ok(json!({ "done": task.id })) }))
    }

    #[tokio::test]
    async fn test_high_complexity_objective_runs_every_group_in_parallel() {
        let sink = Arc::new(InMemoryMetricsSink::new());
        let executor = executor(succeeding()).with_metrics_sink(sink.clone());

        let result = executor.execute_objective(HIGH).await.unwrap();
        let plan = result.plan.as_ref().unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Parallel);
        assert_eq!(result.status, WorkflowState::Completed);
        assert_eq!(result.completed_tasks, plan.task_count());
        assert_eq!(result.success_rate, 1.0);
        assert!(result.validation.as_ref().unwrap().passed);
        assert_eq!(result.agent_performance.len(), plan.groups.len());
        assert!(result
            .agent_performance
            .values()
            .all(|agent| agent.resource_id.is_some()));

        let states: Vec<WorkflowState> = result.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::Planning,
                WorkflowState::ResourceAllocation,
                WorkflowState::Executing,
                WorkflowState::Validating,
                WorkflowState::Completed,
            ]
        );

        assert_eq!(executor.pool.status().active_allocations, 0);
        assert_eq!(sink.workflows().len(), 1);
        assert_eq!(executor.result(&result.workflow_id), Some(result.clone()));
        let status = executor.get_status(&result.workflow_id).unwrap();
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(status.completed_tasks, result.completed_tasks);
    }

    #[tokio::test]
    async fn test_empty_objective_is_an_error() {
        let executor = executor(succeeding());
        assert!(matches!(
            executor.execute_objective("  ").await,
            Err(OrchestrationError::InvalidObjective(_))
        ));
        assert_eq!(executor.get_metrics().workflows_started, 0);
    }

    #[tokio::test]
    async fn test_failed_task_consults_error_recovery() {
        let runner: Arc<dyn TaskRunner> = Arc::new(FnRunner::new(|_task: Task| async move {
            Err::<serde_json::Value, _>(anyhow::anyhow!("tool crashed"))
        }));
        let executor = executor(runner);

        let result = executor.execute_objective("Write the docs").await.unwrap();
        assert_eq!(result.status, WorkflowState::Failed);
        assert_eq!(result.completed_tasks, 0);
        assert_eq!(result.failed_tasks, 1);
        assert!(result.error.is_some());
        assert!(!result.decisions.is_empty());

        let history = executor.engine().history(None);
        assert!(history
            .iter()
            .any(|d| d.decision_type == DecisionType::ErrorRecovery && d.is_executed()));
        let metrics = executor.get_metrics();
        assert_eq!(metrics.workflows_failed, 1);
        assert_eq!(metrics.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_runner_fails_the_workflow() {
        let runner: Arc<dyn TaskRunner> = Arc::new(FnRunner::new(|task: Task| async move {
            if !task.id.is_empty() {
                panic!("evaluator exploded on {}", task.id);
            }
            Ok(json!(null))
        }));
        let sink = Arc::new(InMemoryMetricsSink::new());
        let executor = executor(runner).with_metrics_sink(sink.clone());

        let result = executor.execute_objective("fix the bug").await.unwrap();
        assert_eq!(result.status, WorkflowState::Failed);
        assert_eq!(result.completed_tasks, 0);
        assert_eq!(result.failed_tasks, result.total_tasks);
        assert!(result.error.is_some());
        assert_eq!(
            result.transitions.last().map(|t| t.to),
            Some(WorkflowState::Failed)
        );
        assert_eq!(executor.result(&result.workflow_id), Some(result.clone()));

        let metrics = executor.get_metrics();
        assert_eq!(metrics.active_workflows, 0);
        assert_eq!(metrics.workflows_failed, 1);
        assert_eq!(sink.workflows().len(), 1);
        assert_eq!(executor.pool.status().active_allocations, 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_fails_workflow() {
        let pool = Arc::new(
            ResourcePool::new(PoolConfig {
                auto_scaling: false,
                initial_pool_size: 1,
                min_pool_size: 1,
                max_pool_size: 1,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        // Hold everything the single resource has
        let capacity = pool.config().default_capacity;
        let spec = crate::resource::ResourceSpec::new(
            capacity.cpu,
            capacity.memory_mb,
            capacity.storage_mb,
        );
        let _held = pool.allocate(&spec, Some("other")).unwrap();

        let executor = WorkflowExecutor::new(
            config(),
            pool,
            Arc::new(DecisionEngine::new(DecisionConfig::default())),
            succeeding(),
        )
        .unwrap();
        let result = executor.execute_objective("Write the docs").await.unwrap();
        assert_eq!(result.status, WorkflowState::Failed);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("No resource can satisfy"));
        assert_eq!(result.completed_tasks, 0);
        assert_eq!(result.cancelled_tasks, 1);
        assert_eq!(result.decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_adaptive_switches_to_sequential_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let runner: Arc<dyn TaskRunner> = Arc::new(FnRunner::new(move |task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if task.task_type == "analysis" {
                    anyhow::bail!("analysis backend unavailable");
                }
                Ok(json!(null))
            }
        }));
        let executor = WorkflowExecutor::new(
            WorkflowConfig {
                max_parallel_tasks: 2,
                ..config()
            },
            pool(),
            Arc::new(DecisionEngine::new(DecisionConfig::default())),
            runner,
        )
        .unwrap();

        let result = executor
            .execute_objective("Analyze and optimize the performance of the system database queries")
            .await
            .unwrap();
        let plan = result.plan.as_ref().unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Adaptive);
        assert_eq!(plan.groups[0].capability.as_str(), "analysis");
        assert!(result.failed_tasks >= 1);
        assert_eq!(result.status, WorkflowState::Failed);
        if result.cancelled_tasks == 0 {
            assert_eq!(result.strategy_switches.len(), 1);
            let switch = &result.strategy_switches[0];
            assert_eq!(switch.after_groups, 1);
            assert_eq!(switch.to, ExecutionStrategy::Sequential);
            assert_eq!(result.completed_tasks, 4);
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_finished_workflow() {
        let executor = executor(succeeding());
        assert!(!executor.cancel("workflow-missing"));
        let result = executor.execute_objective("Write the docs").await.unwrap();
        assert!(!executor.cancel(&result.workflow_id));
        assert_eq!(executor.workflow_ids(), vec![result.workflow_id]);
    }

    #[tokio::test]
    async fn test_cancel_running_workflow() {
        let executor = Arc::new(executor(Arc::new(FnRunner::new(|_task: Task| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!(null))
        }))));

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute_objective("Analyze and optimize the performance of the system database queries")
                    .await
            })
        };

        let id = loop {
            if let Some(id) = executor.workflow_ids().pop() {
                if executor
                    .get_status(&id)
                    .is_some_and(|s| s.state == WorkflowState::Executing)
                {
                    break id;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        assert!(executor.cancel(&id));

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowState::Cancelled);
        assert!(result.cancelled_tasks > 0);
        assert_eq!(
            result.completed_tasks + result.failed_tasks + result.cancelled_tasks,
            result.total_tasks
        );
        assert_eq!(executor.get_metrics().workflows_cancelled, 1);
    }

    #[tokio::test]
    async fn test_oldest_finished_workflows_are_evicted() {
        let executor = WorkflowExecutor::new(
            WorkflowConfig {
                max_retained_workflows: 2,
                ..config()
            },
            pool(),
            Arc::new(DecisionEngine::new(DecisionConfig::default())),
            succeeding(),
        )
        .unwrap();

        let mut ids = Vec::new();
        for objective in ["Write the docs", "Write the changelog", "Write the guide"] {
            ids.push(executor.execute_objective(objective).await.unwrap().workflow_id);
        }

        assert_eq!(executor.workflow_ids(), ids[1..].to_vec());
        assert!(executor.result(&ids[0]).is_none());
        assert!(executor.get_status(&ids[0]).is_none());
        assert!(executor.result(&ids[2]).is_some());
        assert_eq!(executor.get_metrics().workflows_started, 3);
    }

    #[test]
    fn test_invalid_configuration_rejected_at_construction() {
        let err = WorkflowExecutor::new(
            WorkflowConfig {
                max_parallel_tasks: 0,
                ..config()
            },
            pool(),
            Arc::new(DecisionEngine::new(DecisionConfig::default())),
            succeeding(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidConfiguration { ref field, .. } if field == "workflow.max_parallel_tasks"
        ));
    }
}
