//! Resource pool for bounded compute capacity
//!
//! Provides allocation of abstract cpu/memory/storage capacity with weighted
//! load balancing, watermark-driven auto-scaling, periodic health checks and
//! RAII-scoped acquisition.

pub mod balancer;
pub mod guard;
pub mod health;
pub mod pool;
pub mod types;

pub use balancer::{BalancerWeights, LoadBalancer};
pub use guard::ResourceGuard;
pub use health::{HealthProbe, SyntheticHealthProbe};
pub use pool::{scaling_decision, ResourcePool};
pub use types::{
    HealthReport, PoolStatus, Resource, ResourceAllocation, ResourceCapacity, ResourceSpec,
    ResourceStatus, ResourceType, ScalingDecision, UsageStats,
};
