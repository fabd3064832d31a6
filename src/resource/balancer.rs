//! Weighted scoring used to pick a resource for an allocation

use super::types::{Resource, ResourceSpec};

/// Relative weight of each scoring factor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancerWeights {
    pub health: f64,
    pub inverse_utilization: f64,
    pub efficiency: f64,
    pub size_match: f64,
    pub priority: f64,
}

impl Default for BalancerWeights {
    fn default() -> Self {
        Self {
            health: 0.30,
            inverse_utilization: 0.25,
            efficiency: 0.20,
            size_match: 0.15,
            priority: 0.10,
        }
    }
}

/// Scores candidate resources for a spec and picks the best
#[derive(Debug, Clone, Default)]
pub struct LoadBalancer {
    weights: BalancerWeights,
}

impl LoadBalancer {
    pub fn new(weights: BalancerWeights) -> Self {
        Self { weights }
    }

    /// Score in [0, 1]; higher is a better placement
    pub fn score(&self, resource: &Resource, spec: &ResourceSpec) -> f64 {
        let w = &self.weights;
        let health = (resource.health_score + resource.performance_score) / 2.0;
        let inverse_utilization = 1.0 - resource.utilization();
        let efficiency = resource.usage.efficiency();
        let size_match = size_match(resource, spec);
        // High-priority work leans harder towards healthy resources
        let priority = f64::from(spec.effective_priority()) / 10.0 * resource.health_score;

        w.health * health
            + w.inverse_utilization * inverse_utilization
            + w.efficiency * efficiency
            + w.size_match * size_match
            + w.priority * priority
    }

    /// Best-scoring resource that can hold the spec
    pub fn select<'a, I>(&self, candidates: I, spec: &ResourceSpec) -> Option<&'a Resource>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        candidates
            .into_iter()
            .filter(|r| r.can_fit(spec))
            .map(|r| (self.score(r, spec), r))
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, r)| r)
    }
}

/// Closeness of the request to the remaining capacity; 1.0 is an exact fit
fn size_match(resource: &Resource, spec: &ResourceSpec) -> f64 {
    let leftover = resource.remaining().minus(&spec.capacity());
    let ratios = leftover.ratios(&resource.capacity);
    1.0 - ratios.iter().sum::<f64>() / ratios.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::types::{ResourceCapacity, ResourceType};

    fn resource(id: &str) -> Resource {
        Resource::new(id, ResourceType::Compute, ResourceCapacity::new(4.0, 1000.0, 1000.0))
    }

    #[test]
    fn test_prefers_healthier_resource() {
        let healthy = resource("healthy");
        let mut sick = resource("sick");
        sick.health_score = 0.6;
        sick.performance_score = 0.6;

        let spec = ResourceSpec::new(1.0, 100.0, 100.0);
        let balancer = LoadBalancer::default();
        let chosen = balancer.select([&sick, &healthy], &spec).unwrap();
        assert_eq!(chosen.id, "healthy");
    }

    #[test]
    fn test_skips_resources_without_room() {
        let mut full = resource("full");
        full.allocated = ResourceCapacity::new(3.5, 0.0, 0.0);
        full.active_allocations = 1;
        full.refresh_status(0.5);
        let open = resource("open");

        let spec = ResourceSpec::new(1.0, 10.0, 10.0);
        let chosen = LoadBalancer::default().select([&full, &open], &spec).unwrap();
        assert_eq!(chosen.id, "open");
    }

    #[test]
    fn test_no_candidate_when_nothing_fits() {
        let spec = ResourceSpec::new(8.0, 10.0, 10.0);
        assert!(LoadBalancer::default().select([&resource("a")], &spec).is_none());
    }

    #[test]
    fn test_score_bounded() {
        let balancer = LoadBalancer::default();
        let score = balancer.score(&resource("a"), &ResourceSpec::new(4.0, 1000.0, 1000.0).with_priority(10));
        assert!(score <= 1.0 + 1e-9);
        assert!(score > 0.9);
    }
}
