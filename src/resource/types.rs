//! Resource, allocation and pool status records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Floating point slack used when comparing capacities
pub(crate) const CAPACITY_EPSILON: f64 = 1e-9;

/// Kind of compute unit a resource represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Compute,
    Memory,
    Storage,
    Gpu,
    Agent,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Compute => "compute",
            ResourceType::Memory => "memory",
            ResourceType::Storage => "storage",
            ResourceType::Gpu => "gpu",
            ResourceType::Agent => "agent",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Available,
    Allocated,
    Busy,
    Maintenance,
    Failed,
}

impl ResourceStatus {
    /// Status implied by a resource's allocations and health.
    ///
    /// Unhealthy resources are `Maintenance` while they still carry work and
    /// `Failed` once idle; healthy ones are `Busy` when any dimension is
    /// exhausted, `Allocated` when holding any allocation, else `Available`.
    pub fn derive(
        active_allocations: usize,
        saturated: bool,
        health_score: f64,
        health_threshold: f64,
    ) -> Self {
        if health_score < health_threshold {
            if active_allocations > 0 {
                ResourceStatus::Maintenance
            } else {
                ResourceStatus::Failed
            }
        } else if saturated {
            ResourceStatus::Busy
        } else if active_allocations > 0 {
            ResourceStatus::Allocated
        } else {
            ResourceStatus::Available
        }
    }

    /// Whether new allocations may land on a resource in this status
    pub fn accepts_allocations(self) -> bool {
        matches!(self, ResourceStatus::Available | ResourceStatus::Allocated)
    }
}

/// Amount of cpu, memory and storage
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub cpu: f64,
    pub memory_mb: f64,
    pub storage_mb: f64,
}

impl ResourceCapacity {
    pub const ZERO: ResourceCapacity = ResourceCapacity {
        cpu: 0.0,
        memory_mb: 0.0,
        storage_mb: 0.0,
    };

    pub fn new(cpu: f64, memory_mb: f64, storage_mb: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            storage_mb,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.cpu > 0.0 && self.memory_mb > 0.0 && self.storage_mb > 0.0
    }

    /// True when `other` fits inside `self` in every dimension
    pub fn covers(&self, other: &ResourceCapacity) -> bool {
        other.cpu <= self.cpu && other.memory_mb <= self.memory_mb && other.storage_mb <= self.storage_mb
    }

    pub fn plus(&self, other: &ResourceCapacity) -> Self {
        Self::new(
            self.cpu + other.cpu,
            self.memory_mb + other.memory_mb,
            self.storage_mb + other.storage_mb,
        )
    }

    /// Component-wise subtraction floored at zero
    pub fn minus(&self, other: &ResourceCapacity) -> Self {
        Self::new(
            (self.cpu - other.cpu).max(0.0),
            (self.memory_mb - other.memory_mb).max(0.0),
            (self.storage_mb - other.storage_mb).max(0.0),
        )
    }

    /// Component-wise maximum
    pub fn max(&self, other: &ResourceCapacity) -> Self {
        Self::new(
            self.cpu.max(other.cpu),
            self.memory_mb.max(other.memory_mb),
            self.storage_mb.max(other.storage_mb),
        )
    }

    /// Per-dimension ratios of `self` to `total`, zero where total is zero
    pub fn ratios(&self, total: &ResourceCapacity) -> [f64; 3] {
        fn ratio(part: f64, whole: f64) -> f64 {
            if whole > 0.0 {
                (part / whole).clamp(0.0, 1.0)
            } else {
                0.0
            }
        }
        [
            ratio(self.cpu, total.cpu),
            ratio(self.memory_mb, total.memory_mb),
            ratio(self.storage_mb, total.storage_mb),
        ]
    }
}

impl fmt::Display for ResourceCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={:.2} memory={:.0}MB storage={:.0}MB",
            self.cpu, self.memory_mb, self.storage_mb
        )
    }
}

/// Resources requested for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: f64,
    pub memory_mb: f64,
    pub storage_mb: f64,
    /// 1 (lowest) to 10 (highest)
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, with = "humantime_serde")]
    pub estimated_duration: Option<Duration>,
}

impl ResourceSpec {
    pub fn new(cpu: f64, memory_mb: f64, storage_mb: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            storage_mb,
            priority: default_priority(),
            estimated_duration: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    pub fn capacity(&self) -> ResourceCapacity {
        ResourceCapacity::new(self.cpu, self.memory_mb, self.storage_mb)
    }

    /// Priority clamped into 1..=10
    pub fn effective_priority(&self) -> u8 {
        self.priority.clamp(1, 10)
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} priority={}", self.capacity(), self.effective_priority())
    }
}

fn default_priority() -> u8 {
    5
}

/// Cumulative usage counters for a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_allocations: u64,
    pub completed_allocations: u64,
    /// Allocations reclaimed after expiring
    pub expired_allocations: u64,
    pub cpu_seconds: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageStats {
    /// Fraction of finished allocations that ended by expiry
    pub fn error_ratio(&self) -> f64 {
        let finished = self.completed_allocations + self.expired_allocations;
        if finished == 0 {
            0.0
        } else {
            self.expired_allocations as f64 / finished as f64
        }
    }

    /// Complement of the error ratio, 1.0 for an unused resource
    pub fn efficiency(&self) -> f64 {
        1.0 - self.error_ratio()
    }
}

/// An allocatable unit of compute capacity tracked by the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: ResourceType,
    pub capacity: ResourceCapacity,
    pub allocated: ResourceCapacity,
    pub status: ResourceStatus,
    pub health_score: f64,
    pub performance_score: f64,
    pub active_allocations: usize,
    pub usage: UsageStats,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(id: impl Into<String>, resource_type: ResourceType, capacity: ResourceCapacity) -> Self {
        Self {
            id: id.into(),
            resource_type,
            capacity,
            allocated: ResourceCapacity::ZERO,
            status: ResourceStatus::Available,
            health_score: 1.0,
            performance_score: 1.0,
            active_allocations: 0,
            usage: UsageStats::default(),
            created_at: Utc::now(),
        }
    }

    /// Capacity not yet reserved
    pub fn remaining(&self) -> ResourceCapacity {
        self.capacity.minus(&self.allocated)
    }

    /// Mean of the per-dimension allocation ratios
    pub fn utilization(&self) -> f64 {
        let ratios = self.allocated.ratios(&self.capacity);
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }

    /// Any dimension fully reserved
    pub fn is_saturated(&self) -> bool {
        let remaining = self.remaining();
        remaining.cpu <= CAPACITY_EPSILON
            || remaining.memory_mb <= CAPACITY_EPSILON
            || remaining.storage_mb <= CAPACITY_EPSILON
    }

    /// Whether the spec can be placed on this resource right now
    pub fn can_fit(&self, spec: &ResourceSpec) -> bool {
        self.status.accepts_allocations() && self.remaining().covers(&spec.capacity())
    }

    pub fn is_idle(&self) -> bool {
        self.active_allocations == 0
    }

    /// Recompute `status` from allocations and health
    pub fn refresh_status(&mut self, health_threshold: f64) {
        self.status = ResourceStatus::derive(
            self.active_allocations,
            self.is_saturated(),
            self.health_score,
            health_threshold,
        );
    }
}

/// A lease of part of a resource's capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: String,
    pub resource_id: String,
    pub spec: ResourceSpec,
    pub owner: Option<String>,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    pub fn held_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.released_at.unwrap_or(now) - self.allocated_at
    }

    /// Held past the absolute ceiling or 1.5x the estimated duration
    pub fn is_expired(&self, now: DateTime<Utc>, ceiling: Duration) -> bool {
        let held = self.held_for(now).to_std().unwrap_or_default();
        if held > ceiling {
            return true;
        }
        match self.spec.estimated_duration {
            Some(estimate) => held.as_secs_f64() > estimate.as_secs_f64() * 1.5,
            None => false,
        }
    }
}

/// Aggregate view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_resources: usize,
    pub available: usize,
    pub allocated: usize,
    pub busy: usize,
    pub maintenance: usize,
    pub failed: usize,
    pub active_allocations: usize,
    pub average_utilization: f64,
    pub average_health: f64,
    pub total_capacity: ResourceCapacity,
    pub total_allocated: ResourceCapacity,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub auto_scaling: bool,
}

/// Outcome of evaluating pool utilization against the watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "count")]
pub enum ScalingDecision {
    ScaleUp(usize),
    ScaleDown(usize),
    NoChange,
}

/// Summary of one health check pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked: usize,
    pub evicted: Vec<String>,
    pub maintenance: Vec<String>,
    pub replenished: usize,
    pub average_health: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_function_of_allocations_and_health() {
        assert_eq!(ResourceStatus::derive(0, false, 1.0, 0.5), ResourceStatus::Available);
        assert_eq!(ResourceStatus::derive(2, false, 1.0, 0.5), ResourceStatus::Allocated);
        assert_eq!(ResourceStatus::derive(1, true, 1.0, 0.5), ResourceStatus::Busy);
        assert_eq!(ResourceStatus::derive(1, false, 0.2, 0.5), ResourceStatus::Maintenance);
        assert_eq!(ResourceStatus::derive(0, false, 0.2, 0.5), ResourceStatus::Failed);
    }

    #[test]
    fn test_utilization_is_mean_of_dimensions() {
        let mut resource = Resource::new("r", ResourceType::Compute, ResourceCapacity::new(4.0, 100.0, 100.0));
        resource.allocated = ResourceCapacity::new(4.0, 50.0, 0.0);
        assert!((resource.utilization() - 0.5).abs() < 1e-9);
        assert!(resource.is_saturated());
    }

    #[test]
    fn test_priority_is_clamped() {
        let spec = ResourceSpec::new(1.0, 1.0, 1.0).with_priority(42);
        assert_eq!(spec.priority, 10);
        let spec = ResourceSpec::new(1.0, 1.0, 1.0).with_priority(0);
        assert_eq!(spec.effective_priority(), 1);
    }

    #[test]
    fn test_allocation_expiry_uses_estimate_and_ceiling() {
        let now = Utc::now();
        let allocation = ResourceAllocation {
            id: "a".into(),
            resource_id: "r".into(),
            spec: ResourceSpec::new(1.0, 1.0, 1.0).with_estimated_duration(Duration::from_secs(10)),
            owner: None,
            allocated_at: now - chrono::Duration::seconds(14),
            released_at: None,
        };
        assert!(!allocation.is_expired(now, Duration::from_secs(3600)));
        assert!(allocation.is_expired(now + chrono::Duration::seconds(2), Duration::from_secs(3600)));
        assert!(allocation.is_expired(now, Duration::from_secs(5)));
    }
}
