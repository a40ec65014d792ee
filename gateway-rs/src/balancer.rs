//! Backend selection
//!
//! Each rule owns a [`LoadBalancer`] built with the snapshot, so its cursor
//! and connection counters live exactly as long as that rule generation.
//! Selection reads one [`HealthView`] and never retries across backends.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::health::{HealthStatus, HealthView};
use crate::rules::{Algorithm, BackendEndpoint};

/// A configured backend plus its live connection count
#[derive(Debug)]
pub struct Endpoint {
    spec: BackendEndpoint,
    active: AtomicUsize,
}

impl Endpoint {
    pub fn new(spec: BackendEndpoint) -> Self {
        Self {
            spec,
            active: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> &BackendEndpoint {
        &self.spec
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn weight(&self) -> u32 {
        self.spec.weight
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Selected endpoint; counts as an active connection until dropped
#[derive(Debug)]
pub struct EndpointGuard {
    endpoint: Arc<Endpoint>,
}

impl EndpointGuard {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        endpoint.active.fetch_add(1, Ordering::Relaxed);
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn address(&self) -> &str {
        self.endpoint.address()
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.endpoint.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pluggable selection algorithm.
///
/// `candidates` holds the eligible endpoints in declaration order and is
/// never empty.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    fn pick(&self, candidates: &[&Arc<Endpoint>]) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Deterministic weighted round-robin.
///
/// The cursor advances by one per selection modulo the total eligible
/// weight; position `p` maps onto the endpoint whose cumulative weight range
/// contains it. Over any `W` consecutive selections each endpoint is picked
/// exactly `weight` times.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: AtomicU64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for WeightedRoundRobin {
    fn pick(&self, candidates: &[&Arc<Endpoint>]) -> Option<usize> {
        let total: u64 = candidates.iter().map(|e| u64::from(e.weight())).sum();
        if total == 0 {
            return None;
        }
        let mut position = self.cursor.fetch_add(1, Ordering::Relaxed) % total;
        for (index, endpoint) in candidates.iter().enumerate() {
            let weight = u64::from(endpoint.weight());
            if position < weight {
                return Some(index);
            }
            position -= weight;
        }
        None
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Fewest active connections, first declared on ties
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn pick(&self, candidates: &[&Arc<Endpoint>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.active_connections())
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Per-rule load balancer
pub struct LoadBalancer {
    rule: String,
    endpoints: Vec<Arc<Endpoint>>,
    policy: Box<dyn SelectionPolicy>,
}

impl LoadBalancer {
    pub fn new(rule: &str, backends: &[BackendEndpoint], algorithm: Algorithm) -> Self {
        let policy: Box<dyn SelectionPolicy> = match algorithm {
            Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
            Algorithm::LeastConnections => Box::new(LeastConnections),
        };
        Self::with_policy(rule, backends, policy)
    }

    pub fn with_policy(
        rule: &str,
        backends: &[BackendEndpoint],
        policy: Box<dyn SelectionPolicy>,
    ) -> Self {
        Self {
            rule: rule.to_string(),
            endpoints: backends
                .iter()
                .cloned()
                .map(|spec| Arc::new(Endpoint::new(spec)))
                .collect(),
            policy,
        }
    }

    /// Pick a backend, skipping endpoints reported unhealthy
    pub fn select(&self, health: &HealthView) -> Result<EndpointGuard> {
        let candidates: Vec<&Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| health.status(e.address()) != HealthStatus::Unhealthy)
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyBackend {
                rule: self.rule.clone(),
            });
        }

        self.policy
            .pick(&candidates)
            .and_then(|index| candidates.get(index))
            .map(|endpoint| EndpointGuard::new(Arc::clone(endpoint)))
            .ok_or_else(|| GatewayError::NoHealthyBackend {
                rule: self.rule.clone(),
            })
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("rule", &self.rule)
            .field(
                "endpoints",
                &self.endpoints.iter().map(|e| e.address()).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::rules::Protocol;

    fn backends(weights: &[(&str, u32)]) -> Vec<BackendEndpoint> {
        weights
            .iter()
            .map(|(addr, w)| BackendEndpoint::new(*addr, Protocol::Http, *w))
            .collect()
    }

    fn pick(lb: &LoadBalancer, registry: &HealthRegistry) -> String {
        lb.select(&registry.view()).unwrap().address().to_string()
    }

    #[test]
    fn test_weighted_round_robin_ratio() {
        let lb = LoadBalancer::new(
            "web",
            &backends(&[("10.0.0.1:80", 3), ("10.0.0.2:80", 1)]),
            Algorithm::WeightedRoundRobin,
        );
        let registry = HealthRegistry::new();

        let picks: Vec<String> = (0..40).map(|_| pick(&lb, &registry)).collect();
        for window in picks.windows(4) {
            let heavy = window.iter().filter(|a| *a == "10.0.0.1:80").count();
            assert_eq!(heavy, 3, "window {:?}", window);
        }
    }

    #[test]
    fn test_equal_weights_follow_declaration_order() {
        let lb = LoadBalancer::new(
            "web",
            &backends(&[("a:80", 1), ("b:80", 1), ("c:80", 1)]),
            Algorithm::WeightedRoundRobin,
        );
        let registry = HealthRegistry::new();
        let picks: Vec<String> = (0..6).map(|_| pick(&lb, &registry)).collect();
        assert_eq!(picks, ["a:80", "b:80", "c:80", "a:80", "b:80", "c:80"]);
    }

    #[test]
    fn test_unhealthy_excluded_until_recovered() {
        let lb = LoadBalancer::new(
            "web",
            &backends(&[("a:80", 1), ("b:80", 1)]),
            Algorithm::WeightedRoundRobin,
        );
        let registry = HealthRegistry::new();

        registry.report("a:80", false);
        for _ in 0..5 {
            assert_eq!(pick(&lb, &registry), "b:80");
        }

        registry.report("a:80", true);
        let picks: Vec<String> = (0..4).map(|_| pick(&lb, &registry)).collect();
        assert!(picks.iter().any(|a| a == "a:80"));
    }

    #[test]
    fn test_all_unhealthy_is_no_healthy_backend() {
        let lb = LoadBalancer::new(
            "web",
            &backends(&[("a:80", 1), ("b:80", 2)]),
            Algorithm::WeightedRoundRobin,
        );
        let registry = HealthRegistry::new();
        registry.report("a:80", false);
        registry.report("b:80", false);
        // duplicate reports are harmless
        registry.report("b:80", false);

        let err = lb.select(&registry.view()).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackend { ref rule } if rule == "web"));
    }

    #[test]
    fn test_least_connections() {
        let lb = LoadBalancer::new(
            "db",
            &backends(&[("a:5432", 1), ("b:5432", 1)]),
            Algorithm::LeastConnections,
        );
        let registry = HealthRegistry::new();

        let first = lb.select(&registry.view()).unwrap();
        assert_eq!(first.address(), "a:5432");
        let second = lb.select(&registry.view()).unwrap();
        assert_eq!(second.address(), "b:5432");

        drop(first);
        assert_eq!(lb.endpoints()[0].active_connections(), 0);
        assert_eq!(pick(&lb, &registry), "a:5432");
        drop(second);
    }

    #[derive(Debug)]
    struct AlwaysLast;

    impl SelectionPolicy for AlwaysLast {
        fn pick(&self, candidates: &[&Arc<Endpoint>]) -> Option<usize> {
            candidates.len().checked_sub(1)
        }

        fn name(&self) -> &'static str {
            "always_last"
        }
    }

    #[test]
    fn test_custom_policy_plugs_in() {
        let lb = LoadBalancer::with_policy(
            "custom",
            &backends(&[("a:80", 1), ("b:80", 1)]),
            Box::new(AlwaysLast),
        );
        let registry = HealthRegistry::new();
        assert_eq!(pick(&lb, &registry), "b:80");
        assert_eq!(lb.policy_name(), "always_last");
    }
}
