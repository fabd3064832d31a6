//! Dynamic resource pool with load balancing, auto-scaling and health checks

use super::balancer::LoadBalancer;
use super::guard::ResourceGuard;
use super::health::{HealthProbe, SyntheticHealthProbe};
use super::types::{
    HealthReport, PoolStatus, Resource, ResourceAllocation, ResourceCapacity, ResourceSpec,
    ResourceStatus, ResourceType, ScalingDecision,
};
use crate::cancel::CancellationFlag;
use crate::config::PoolConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource table and allocation map, guarded together
#[derive(Debug, Default)]
struct PoolState {
    resources: BTreeMap<String, Resource>,
    allocations: HashMap<String, ResourceAllocation>,
    next_resource: u64,
}

impl PoolState {
    fn add_resource(&mut self, capacity: ResourceCapacity, health_threshold: f64) -> String {
        self.next_resource += 1;
        let id = format!("res-{:04}", self.next_resource);
        let mut resource = Resource::new(id.clone(), ResourceType::Compute, capacity);
        resource.refresh_status(health_threshold);
        self.resources.insert(id.clone(), resource);
        id
    }

    fn average_utilization(&self) -> f64 {
        if self.resources.is_empty() {
            return 0.0;
        }
        self.resources.values().map(Resource::utilization).sum::<f64>() / self.resources.len() as f64
    }
}

/// Pure scaling rule over average utilization and pool size
pub fn scaling_decision(config: &PoolConfig, average_utilization: f64, pool_size: usize) -> ScalingDecision {
    if average_utilization > config.scale_up_threshold && pool_size < config.max_pool_size {
        let room = config.max_pool_size - pool_size;
        ScalingDecision::ScaleUp(config.scale_up_increment.min(room).max(1))
    } else if average_utilization < config.scale_down_threshold && pool_size > config.min_pool_size {
        let surplus = pool_size - config.min_pool_size;
        ScalingDecision::ScaleDown(config.scale_down_decrement.min(surplus).max(1))
    } else {
        ScalingDecision::NoChange
    }
}

/// Pool of abstract compute resources
///
/// One mutex guards the resource table and the allocation map; it is a
/// synchronous lock and is never held across an `.await`.
pub struct ResourcePool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
    balancer: LoadBalancer,
    probe: Box<dyn HealthProbe>,
    shutdown: CancellationFlag,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourcePool {
    /// Create a pool holding `initial_pool_size` resources
    pub fn new(config: PoolConfig) -> OrchestrationResult<Self> {
        config.validate()?;

        let mut state = PoolState::default();
        for _ in 0..config.initial_pool_size {
            state.add_resource(config.default_capacity, config.health_threshold);
        }
        info!(
            resources = config.initial_pool_size,
            min = config.min_pool_size,
            max = config.max_pool_size,
            "Resource pool initialized"
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
            released: Notify::new(),
            balancer: LoadBalancer::default(),
            probe: Box::new(SyntheticHealthProbe::default()),
            shutdown: CancellationFlag::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn with_health_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_balancer(mut self, balancer: LoadBalancer) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Reserve capacity for `spec` on the best-scoring resource.
    ///
    /// When nothing fits and auto-scaling is enabled, one resource sized for
    /// the request is added (bounded by `max_pool_size`) and selection is
    /// retried once.
    pub fn allocate(
        &self,
        spec: &ResourceSpec,
        owner: Option<&str>,
    ) -> OrchestrationResult<ResourceAllocation> {
        let mut state = self.state.lock();

        let resource_id = match self.select(&state, spec) {
            Some(id) => id,
            None if self.config.auto_scaling && state.resources.len() < self.config.max_pool_size => {
                let capacity = self.config.default_capacity.max(&spec.capacity());
                let id = state.add_resource(capacity, self.config.health_threshold);
                info!(resource_id = %id, %spec, "Added resource to satisfy allocation");
                match self.select(&state, spec) {
                    Some(id) => id,
                    None => return Err(self.unavailable(&state, spec)),
                }
            }
            None => return Err(self.unavailable(&state, spec)),
        };

        let Some(resource) = state.resources.get_mut(&resource_id) else {
            return Err(self.unavailable(&state, spec));
        };

        let now = Utc::now();
        resource.allocated = resource.allocated.plus(&spec.capacity());
        resource.active_allocations += 1;
        resource.usage.total_allocations += 1;
        resource.usage.last_used = Some(now);
        resource.refresh_status(self.config.health_threshold);

        let allocation = ResourceAllocation {
            id: format!("alloc-{}", Uuid::new_v4()),
            resource_id,
            spec: spec.clone(),
            owner: owner.map(str::to_string),
            allocated_at: now,
            released_at: None,
        };
        state.allocations.insert(allocation.id.clone(), allocation.clone());

        debug!(
            allocation_id = %allocation.id,
            resource_id = %allocation.resource_id,
            owner = ?allocation.owner,
            "Allocated resource"
        );
        Ok(allocation)
    }

    /// Wait until `spec` can be allocated or `timeout` elapses.
    ///
    /// Waiters are woken whenever capacity is returned or added.
    pub async fn acquire(
        self: &Arc<Self>,
        spec: &ResourceSpec,
        owner: Option<&str>,
        timeout: Duration,
    ) -> OrchestrationResult<ResourceGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            let capacity_changed = self.released.notified();
            match self.allocate(spec, owner) {
                Ok(allocation) => return Ok(ResourceGuard::new(Arc::clone(self), allocation)),
                Err(err @ OrchestrationError::ResourceUnavailable { .. }) => {
                    if tokio::time::timeout_at(deadline, capacity_changed).await.is_err() {
                        debug!(%spec, ?timeout, "Timed out waiting for resource");
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Return an allocation's capacity to its resource.
    ///
    /// Returns false when the allocation is unknown or already released.
    pub fn release(&self, allocation_id: &str) -> bool {
        self.release_inner(allocation_id, false)
    }

    /// Release every allocation tagged with `owner`
    pub fn release_owner(&self, owner: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .allocations
                .values()
                .filter(|a| a.owner.as_deref() == Some(owner))
                .map(|a| a.id.clone())
                .collect()
        };
        ids.iter().filter(|id| self.release(id)).count()
    }

    fn release_inner(&self, allocation_id: &str, expired: bool) -> bool {
        {
            let mut state = self.state.lock();
            let Some(mut allocation) = state.allocations.remove(allocation_id) else {
                return false;
            };
            let now = Utc::now();
            allocation.released_at = Some(now);

            if let Some(resource) = state.resources.get_mut(&allocation.resource_id) {
                resource.active_allocations = resource.active_allocations.saturating_sub(1);
                resource.allocated = if resource.active_allocations == 0 {
                    ResourceCapacity::ZERO
                } else {
                    resource.allocated.minus(&allocation.spec.capacity())
                };
                if expired {
                    resource.usage.expired_allocations += 1;
                } else {
                    resource.usage.completed_allocations += 1;
                }
                let held = allocation.held_for(now).num_milliseconds().max(0) as f64 / 1000.0;
                resource.usage.cpu_seconds += allocation.spec.cpu * held;
                resource.usage.last_used = Some(now);
                resource.refresh_status(self.config.health_threshold);
            }
            debug!(
                allocation_id,
                resource_id = %allocation.resource_id,
                expired,
                "Released allocation"
            );
        }
        self.released.notify_waiters();
        true
    }

    /// Resources that accept new allocations, optionally only those that fit `spec`
    pub fn list_available(&self, spec: Option<&ResourceSpec>) -> Vec<Resource> {
        let state = self.state.lock();
        state
            .resources
            .values()
            .filter(|r| match spec {
                Some(spec) => r.can_fit(spec),
                None => r.status.accepts_allocations(),
            })
            .cloned()
            .collect()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let count = |status: ResourceStatus| {
            state
                .resources
                .values()
                .filter(|r| r.status == status)
                .count()
        };
        let total_resources = state.resources.len();
        let average_health = if total_resources == 0 {
            0.0
        } else {
            state.resources.values().map(|r| r.health_score).sum::<f64>() / total_resources as f64
        };

        PoolStatus {
            total_resources,
            available: count(ResourceStatus::Available),
            allocated: count(ResourceStatus::Allocated),
            busy: count(ResourceStatus::Busy),
            maintenance: count(ResourceStatus::Maintenance),
            failed: count(ResourceStatus::Failed),
            active_allocations: state.allocations.len(),
            average_utilization: state.average_utilization(),
            average_health,
            total_capacity: state
                .resources
                .values()
                .fold(ResourceCapacity::ZERO, |acc, r| acc.plus(&r.capacity)),
            total_allocated: state
                .resources
                .values()
                .fold(ResourceCapacity::ZERO, |acc, r| acc.plus(&r.allocated)),
            min_pool_size: self.config.min_pool_size,
            max_pool_size: self.config.max_pool_size,
            auto_scaling: self.config.auto_scaling,
        }
    }

    pub fn resource(&self, id: &str) -> Option<Resource> {
        self.state.lock().resources.get(id).cloned()
    }

    pub fn allocation(&self, id: &str) -> Option<ResourceAllocation> {
        self.state.lock().allocations.get(id).cloned()
    }

    pub fn active_allocations(&self) -> Vec<ResourceAllocation> {
        self.state.lock().allocations.values().cloned().collect()
    }

    /// Compare average utilization with the watermarks
    pub fn evaluate_scaling(&self) -> ScalingDecision {
        let state = self.state.lock();
        scaling_decision(&self.config, state.average_utilization(), state.resources.len())
    }

    /// Evaluate and apply a scaling decision; returns what was applied
    pub fn auto_scale(&self) -> ScalingDecision {
        if !self.config.auto_scaling {
            return ScalingDecision::NoChange;
        }
        let decision = self.evaluate_scaling();
        self.apply_scaling(decision)
    }

    /// Scaling hint from a consumer reporting its own load.
    ///
    /// The pool still makes the decision: sustained pressure blocks a
    /// scale-down and, when no resource is fully free, grows the pool by one
    /// increment.
    pub fn consider_scaling(&self, pressure: f64) -> ScalingDecision {
        if !self.config.auto_scaling {
            return ScalingDecision::NoChange;
        }
        let under_pressure = pressure >= self.config.scale_up_threshold;
        let decision = {
            let state = self.state.lock();
            let size = state.resources.len();
            match scaling_decision(&self.config, state.average_utilization(), size) {
                ScalingDecision::ScaleDown(_) if under_pressure => ScalingDecision::NoChange,
                ScalingDecision::NoChange
                    if under_pressure
                        && size < self.config.max_pool_size
                        && !state
                            .resources
                            .values()
                            .any(|r| r.status == ResourceStatus::Available) =>
                {
                    ScalingDecision::ScaleUp(
                        self.config.scale_up_increment.min(self.config.max_pool_size - size),
                    )
                }
                other => other,
            }
        };
        debug!(pressure, ?decision, "Considered scaling");
        self.apply_scaling(decision)
    }

    fn apply_scaling(&self, decision: ScalingDecision) -> ScalingDecision {
        match decision {
            ScalingDecision::ScaleUp(n) => match self.scale_up(n) {
                0 => ScalingDecision::NoChange,
                added => ScalingDecision::ScaleUp(added),
            },
            ScalingDecision::ScaleDown(n) => match self.scale_down(n).len() {
                0 => ScalingDecision::NoChange,
                removed => ScalingDecision::ScaleDown(removed),
            },
            ScalingDecision::NoChange => ScalingDecision::NoChange,
        }
    }

    /// Add up to `count` resources without exceeding `max_pool_size`
    pub fn scale_up(&self, count: usize) -> usize {
        let (added, size) = {
            let mut state = self.state.lock();
            let room = self.config.max_pool_size.saturating_sub(state.resources.len());
            let added = count.min(room);
            for _ in 0..added {
                state.add_resource(self.config.default_capacity, self.config.health_threshold);
            }
            (added, state.resources.len())
        };
        if added > 0 {
            info!(added, pool_size = size, "Scaled resource pool up");
            self.released.notify_waiters();
        }
        added
    }

    /// Remove up to `count` idle resources without going below `min_pool_size`.
    ///
    /// Least healthy resources go first, newest first among equals.
    pub fn scale_down(&self, count: usize) -> Vec<String> {
        let mut state = self.state.lock();
        let surplus = state.resources.len().saturating_sub(self.config.min_pool_size);

        let mut idle: Vec<(f64, String)> = state
            .resources
            .values()
            .filter(|r| r.is_idle())
            .map(|r| (r.health_score, r.id.clone()))
            .collect();
        idle.sort_by(|(ha, ia), (hb, ib)| ha.total_cmp(hb).then_with(|| ib.cmp(ia)));

        let removed: Vec<String> = idle
            .into_iter()
            .take(count.min(surplus))
            .map(|(_, id)| id)
            .collect();
        for id in &removed {
            state.resources.remove(id);
        }
        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                pool_size = state.resources.len(),
                "Scaled resource pool down"
            );
        }
        removed
    }

    /// Recompute health for every resource.
    ///
    /// Unhealthy idle resources are evicted, unhealthy busy ones are put in
    /// maintenance, and the pool is topped back up to `min_pool_size`.
    pub fn run_health_check(&self) -> HealthReport {
        let threshold = self.config.health_threshold;
        let (report, reopened) = {
            let mut state = self.state.lock();
            let mut report = HealthReport::default();
            let mut reopened = 0usize;

            for resource in state.resources.values_mut() {
                let was_open = resource.status.accepts_allocations();
                let health = self.probe.probe(resource).clamp(0.0, 1.0);
                resource.health_score = health;
                resource.performance_score = 0.8 * resource.performance_score + 0.2 * health;
                resource.refresh_status(threshold);
                report.checked += 1;
                if !was_open && resource.status.accepts_allocations() {
                    reopened += 1;
                }

                if health < threshold {
                    if resource.is_idle() {
                        report.evicted.push(resource.id.clone());
                    } else {
                        warn!(
                            resource_id = %resource.id,
                            health,
                            active_allocations = resource.active_allocations,
                            "Resource unhealthy, flagged for maintenance"
                        );
                        report.maintenance.push(resource.id.clone());
                    }
                }
            }

            for id in &report.evicted {
                state.resources.remove(id);
                warn!(resource_id = %id, "Evicted unhealthy idle resource");
            }

            while state.resources.len() < self.config.min_pool_size {
                state.add_resource(self.config.default_capacity, threshold);
                report.replenished += 1;
            }

            report.average_health = if state.resources.is_empty() {
                0.0
            } else {
                state.resources.values().map(|r| r.health_score).sum::<f64>()
                    / state.resources.len() as f64
            };
            (report, reopened)
        };

        if report.replenished > 0 {
            info!(added = report.replenished, "Replenished pool to minimum size");
        }
        if reopened > 0 {
            info!(reopened, "Resources accepting allocations again");
        }
        if report.replenished > 0 || reopened > 0 {
            self.released.notify_waiters();
        }
        debug!(
            checked = report.checked,
            evicted = report.evicted.len(),
            maintenance = report.maintenance.len(),
            average_health = report.average_health,
            "Health check complete"
        );
        report
    }

    /// Release allocations held past the ceiling or 1.5x their estimate
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<ResourceAllocation> = {
            let state = self.state.lock();
            state
                .allocations
                .values()
                .filter(|a| a.is_expired(now, self.config.allocation_timeout))
                .cloned()
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(expired.len());
        for allocation in expired {
            let err = OrchestrationError::AllocationExpired {
                allocation_id: allocation.id.clone(),
                resource_id: allocation.resource_id.clone(),
                held_secs: allocation.held_for(now).num_seconds(),
            };
            if self.release_inner(&allocation.id, true) {
                warn!(owner = ?allocation.owner, "{}", err);
                reclaimed.push(allocation.id);
            }
        }
        reclaimed
    }

    /// Spawn the scaling and health loops; a no-op while they are running
    pub fn start_background(self: &Arc<Self>) {
        let mut handles = self.background.lock();
        if !handles.is_empty() {
            return;
        }
        self.shutdown.reset();

        if self.config.auto_scaling {
            handles.push(spawn_loop(
                Arc::downgrade(self),
                self.config.scaling_interval,
                self.shutdown.clone(),
                |pool| {
                    pool.auto_scale();
                },
            ));
        }
        handles.push(spawn_loop(
            Arc::downgrade(self),
            self.config.health_check_interval,
            self.shutdown.clone(),
            |pool| {
                pool.reclaim_expired(Utc::now());
                pool.run_health_check();
            },
        ));
        info!(loops = handles.len(), "Resource pool background loops started");
    }

    /// Stop the background loops and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Resource pool background loop ended abnormally: {}", e);
            }
        }
        debug!("Resource pool background loops stopped");
    }

    fn select(&self, state: &PoolState, spec: &ResourceSpec) -> Option<String> {
        self.balancer
            .select(state.resources.values(), spec)
            .map(|r| r.id.clone())
    }

    fn unavailable(&self, state: &PoolState, spec: &ResourceSpec) -> OrchestrationError {
        OrchestrationError::ResourceUnavailable {
            requested: spec.to_string(),
            pool_size: state.resources.len(),
            max_pool_size: self.config.max_pool_size,
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("size", &self.size())
            .finish()
    }
}

fn spawn_loop<F>(
    pool: Weak<ResourcePool>,
    period: Duration,
    shutdown: CancellationFlag,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&ResourcePool) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let Some(pool) = pool.upgrade() else {
                break;
            };
            tick(&*pool);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config(min: usize, max: usize, initial: usize) -> PoolConfig {
        PoolConfig {
            initial_pool_size: initial,
            min_pool_size: min,
            max_pool_size: max,
            default_capacity: ResourceCapacity::new(4.0, 1000.0, 1000.0),
            ..PoolConfig::default()
        }
    }

    /// Probe returning a settable fixed score
    struct FixedProbe(AtomicU64);

    impl FixedProbe {
        fn new(score: f64) -> Self {
            Self(AtomicU64::new(score.to_bits()))
        }
    }

    impl HealthProbe for FixedProbe {
        fn probe(&self, _resource: &Resource) -> f64 {
            f64::from_bits(self.0.load(Ordering::SeqCst))
        }
    }

    impl HealthProbe for Arc<FixedProbe> {
        fn probe(&self, resource: &Resource) -> f64 {
            self.as_ref().probe(resource)
        }
    }

    fn fill_each(pool: &ResourcePool, fraction: f64) -> Vec<ResourceAllocation> {
        let spec = ResourceSpec::new(4.0 * fraction, 1000.0 * fraction, 1000.0 * fraction);
        (0..pool.size())
            .map(|_| pool.allocate(&spec, Some("filler")).unwrap())
            .collect()
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = ResourcePool::new(config(1, 2, 1)).unwrap();
        let allocation = pool.allocate(&ResourceSpec::new(1.0, 100.0, 100.0), None).unwrap();

        assert!(pool.release(&allocation.id));
        let after_first = pool.resource(&allocation.resource_id).unwrap();
        assert!(!pool.release(&allocation.id));
        let after_second = pool.resource(&allocation.resource_id).unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.allocated, ResourceCapacity::ZERO);
        assert_eq!(after_second.status, ResourceStatus::Available);
    }

    #[test]
    fn test_unavailable_without_auto_scaling() {
        let pool = ResourcePool::new(PoolConfig {
            auto_scaling: false,
            ..config(1, 4, 1)
        })
        .unwrap();
        let spec = ResourceSpec::new(3.0, 100.0, 100.0);
        pool.allocate(&spec, None).unwrap();

        let err = pool.allocate(&spec, None).unwrap_err();
        assert!(matches!(err, OrchestrationError::ResourceUnavailable { pool_size: 1, .. }));
    }

    #[test]
    fn test_auto_scaling_adds_resource_up_to_max() {
        let pool = ResourcePool::new(config(1, 2, 1)).unwrap();
        let spec = ResourceSpec::new(3.0, 100.0, 100.0);

        pool.allocate(&spec, None).unwrap();
        let second = pool.allocate(&spec, None).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(second.resource_id, "res-0002");

        assert!(pool.allocate(&spec, None).is_err());
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_oversized_request_gets_matching_resource() {
        let pool = ResourcePool::new(config(1, 2, 1)).unwrap();
        let spec = ResourceSpec::new(16.0, 100.0, 100.0);
        let allocation = pool.allocate(&spec, None).unwrap();
        let resource = pool.resource(&allocation.resource_id).unwrap();
        assert_eq!(resource.capacity.cpu, 16.0);
        assert_eq!(resource.capacity.memory_mb, 1000.0);
    }

    #[test]
    fn test_release_owner() {
        let pool = ResourcePool::new(config(1, 4, 2)).unwrap();
        let spec = ResourceSpec::new(1.0, 10.0, 10.0);
        pool.allocate(&spec, Some("agent-a")).unwrap();
        pool.allocate(&spec, Some("agent-a")).unwrap();
        pool.allocate(&spec, Some("agent-b")).unwrap();

        assert_eq!(pool.release_owner("agent-a"), 2);
        assert_eq!(pool.active_allocations().len(), 1);
    }

    #[test]
    fn test_scaling_respects_bounds() {
        let pool = ResourcePool::new(config(2, 5, 2)).unwrap();

        let first = fill_each(&pool, 0.9);
        assert_eq!(pool.evaluate_scaling(), ScalingDecision::ScaleUp(2));
        assert_eq!(pool.auto_scale(), ScalingDecision::ScaleUp(2));
        assert_eq!(pool.size(), 4);

        // Push the new resources to 0.9 as well; only one slot left under max
        let spec = ResourceSpec::new(3.6, 900.0, 900.0);
        let extra: Vec<_> = (0..2).map(|_| pool.allocate(&spec, None).unwrap()).collect();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.auto_scale(), ScalingDecision::ScaleUp(1));
        assert_eq!(pool.size(), 5);
        assert_eq!(pool.auto_scale(), ScalingDecision::NoChange);

        for allocation in first.iter().chain(extra.iter()) {
            assert!(pool.release(&allocation.id));
        }

        for _ in 0..10 {
            pool.auto_scale();
            assert!(pool.size() >= 2);
        }
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.evaluate_scaling(), ScalingDecision::NoChange);
    }

    #[test]
    fn test_scale_down_skips_busy_resources() {
        let pool = ResourcePool::new(config(1, 4, 3)).unwrap();
        let held = pool.allocate(&ResourceSpec::new(0.1, 1.0, 1.0), None).unwrap();

        let removed = pool.scale_down(5);
        assert_eq!(removed.len(), 2);
        assert!(!removed.contains(&held.resource_id));
        assert!(pool.resource(&held.resource_id).is_some());
    }

    #[test]
    fn test_consider_scaling_blocks_shrink_under_pressure() {
        let pool = ResourcePool::new(config(1, 4, 3)).unwrap();
        assert_eq!(pool.consider_scaling(0.95), ScalingDecision::NoChange);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.consider_scaling(0.1), ScalingDecision::ScaleDown(1));
    }

    #[test]
    fn test_health_check_evicts_idle_and_flags_busy() {
        let probe = Arc::new(FixedProbe::new(0.2));
        let pool = ResourcePool::new(config(2, 4, 2))
            .unwrap()
            .with_health_probe(probe.clone());
        let held = pool.allocate(&ResourceSpec::new(1.0, 10.0, 10.0), None).unwrap();

        let report = pool.run_health_check();
        assert_eq!(report.checked, 2);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.maintenance, vec![held.resource_id.clone()]);
        assert_eq!(report.replenished, 1);
        assert_eq!(pool.size(), 2);

        let flagged = pool.resource(&held.resource_id).unwrap();
        assert_eq!(flagged.status, ResourceStatus::Maintenance);

        // Maintenance resources never take new work
        let next = pool.allocate(&ResourceSpec::new(0.5, 1.0, 1.0), None).unwrap();
        assert_ne!(next.resource_id, held.resource_id);

        probe.0.store(0.9f64.to_bits(), Ordering::SeqCst);
        pool.run_health_check();
        assert_eq!(
            pool.resource(&held.resource_id).unwrap().status,
            ResourceStatus::Allocated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_resource_wakes_waiting_acquire() {
        let probe = Arc::new(FixedProbe::new(0.2));
        let pool = Arc::new(
            ResourcePool::new(PoolConfig {
                auto_scaling: false,
                ..config(1, 1, 1)
            })
            .unwrap()
            .with_health_probe(probe.clone()),
        );
        let held = pool.allocate(&ResourceSpec::new(1.0, 10.0, 10.0), None).unwrap();
        let report = pool.run_health_check();
        assert_eq!(report.maintenance, vec![held.resource_id.clone()]);
        assert_eq!(report.replenished, 0);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(&ResourceSpec::new(1.0, 10.0, 10.0), None, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        probe.0.store(0.9f64.to_bits(), Ordering::SeqCst);
        pool.run_health_check();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiter.is_finished());

        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.resource_id(), held.resource_id);
    }

    #[test]
    fn test_reclaim_expired_allocations() {
        let pool = ResourcePool::new(config(1, 2, 1)).unwrap();
        let spec = ResourceSpec::new(1.0, 10.0, 10.0).with_estimated_duration(Duration::from_secs(10));
        let allocation = pool.allocate(&spec, Some("slow")).unwrap();
        let fresh = pool.allocate(&ResourceSpec::new(1.0, 10.0, 10.0), None).unwrap();

        assert!(pool.reclaim_expired(Utc::now()).is_empty());
        let later = Utc::now() + chrono::Duration::seconds(16);
        assert_eq!(pool.reclaim_expired(later), vec![allocation.id.clone()]);
        assert!(pool.allocation(&allocation.id).is_none());
        assert!(pool.allocation(&fresh.id).is_some());

        let resource = pool.resource(&allocation.resource_id).unwrap();
        assert_eq!(resource.usage.expired_allocations, 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let pool = Arc::new(ResourcePool::new(config(1, 2, 1)).unwrap());
        let spec = ResourceSpec::new(1.0, 10.0, 10.0);
        {
            let guard = pool.acquire(&spec, Some("t"), Duration::from_secs(1)).await.unwrap();
            assert!(pool.allocation(guard.allocation_id()).is_some());
        }
        assert!(pool.active_allocations().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(
            ResourcePool::new(PoolConfig {
                auto_scaling: false,
                ..config(1, 1, 1)
            })
            .unwrap(),
        );
        let spec = ResourceSpec::new(3.0, 10.0, 10.0);
        let held = pool.acquire(&spec, None, Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let spec = spec.clone();
            tokio::spawn(async move { pool.acquire(&spec, None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.resource_id(), "res-0001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let pool = Arc::new(
            ResourcePool::new(PoolConfig {
                auto_scaling: false,
                ..config(1, 1, 1)
            })
            .unwrap(),
        );
        let spec = ResourceSpec::new(8.0, 10.0, 10.0);
        let err = pool
            .acquire(&spec, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "resource_unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_scale_and_stop() {
        let pool = Arc::new(
            ResourcePool::new(PoolConfig {
                scaling_interval: Duration::from_millis(50),
                health_check_interval: Duration::from_millis(50),
                ..config(1, 4, 3)
            })
            .unwrap()
            .with_health_probe(FixedProbe::new(1.0)),
        );
        pool.start_background();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.size(), 1);

        pool.shutdown().await;
        assert!(pool.background.lock().is_empty());
    }

    proptest! {
        #[test]
        fn prop_allocation_never_exceeds_capacity(
            capacity in (1.0f64..16.0, 64.0f64..4096.0, 64.0f64..4096.0),
            specs in prop::collection::vec((0.1f64..8.0, 1.0f64..2048.0, 1.0f64..2048.0), 1..40),
            auto_scaling in any::<bool>(),
        ) {
            let pool = ResourcePool::new(PoolConfig {
                initial_pool_size: 2,
                min_pool_size: 1,
                max_pool_size: 4,
                auto_scaling,
                default_capacity: ResourceCapacity::new(capacity.0, capacity.1, capacity.2),
                ..PoolConfig::default()
            }).unwrap();

            for (i, (cpu, mem, storage)) in specs.into_iter().enumerate() {
                let spec = ResourceSpec::new(cpu, mem, storage);
                if let Ok(allocation) = pool.allocate(&spec, None) {
                    let resource = pool.resource(&allocation.resource_id).unwrap();
                    prop_assert!(resource.allocated.cpu <= resource.capacity.cpu + 1e-9);
                    prop_assert!(resource.allocated.memory_mb <= resource.capacity.memory_mb + 1e-9);
                    prop_assert!(resource.allocated.storage_mb <= resource.capacity.storage_mb + 1e-9);
                    if i % 3 == 0 {
                        prop_assert!(pool.release(&allocation.id));
                    }
                }
                let status = pool.status();
                prop_assert!(status.total_allocated.cpu <= status.total_capacity.cpu + 1e-9);
                prop_assert!(status.total_allocated.memory_mb <= status.total_capacity.memory_mb + 1e-9);
            }
        }
    }
}
