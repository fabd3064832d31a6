//! Scoped resource acquisition

use super::pool::ResourcePool;
use super::types::ResourceAllocation;
use std::sync::Arc;
use tracing::debug;

/// RAII guard for a pool allocation
///
/// The allocation is returned to the pool when the guard is dropped, on every
/// exit path including early returns, task cancellation and panics.
pub struct ResourceGuard {
    pool: Arc<ResourcePool>,
    allocation: ResourceAllocation,
    released: bool,
}

impl ResourceGuard {
    pub(crate) fn new(pool: Arc<ResourcePool>, allocation: ResourceAllocation) -> Self {
        Self {
            pool,
            allocation,
            released: false,
        }
    }

    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    pub fn allocation_id(&self) -> &str {
        &self.allocation.id
    }

    pub fn resource_id(&self) -> &str {
        &self.allocation.resource_id
    }

    /// Release now instead of at drop; returns whether the pool still held it
    pub fn release(mut self) -> bool {
        self.released = true;
        self.pool.release(&self.allocation.id)
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(allocation_id = %self.allocation.id, "Releasing allocation on guard drop");
            self.pool.release(&self.allocation.id);
        }
    }
}

impl std::ops::Deref for ResourceGuard {
    type Target = ResourceAllocation;

    fn deref(&self) -> &Self::Target {
        &self.allocation
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("allocation", &self.allocation)
            .field("released", &self.released)
            .finish()
    }
}
