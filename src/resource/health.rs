//! Health signals for pooled resources

use super::types::Resource;
use rand::Rng;

/// Computes a health score in [0, 1] for a resource
///
/// Called while the pool table is locked, so implementations must not block.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, resource: &Resource) -> f64;
}

/// Health from load (utilization plus bounded random noise) and the
/// resource's expiry ratio
#[derive(Debug, Clone)]
pub struct SyntheticHealthProbe {
    /// Maximum absolute noise added to the load signal
    pub noise: f64,
}

impl Default for SyntheticHealthProbe {
    fn default() -> Self {
        Self { noise: 0.05 }
    }
}

impl HealthProbe for SyntheticHealthProbe {
    fn probe(&self, resource: &Resource) -> f64 {
        let noise = if self.noise > 0.0 {
            rand::rng().random_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        let load = (resource.utilization() + noise).clamp(0.0, 1.0);
        let error_ratio = resource.usage.error_ratio();
        (1.0 - 0.4 * load - 0.6 * error_ratio).clamp(0.0, 1.0)
    }
}
