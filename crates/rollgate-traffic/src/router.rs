//! Weighted request routing between stable and canary backend pools.
//!
//! Each service has two pools. A request reads the service's canary
//! weight exactly once and is routed to one cohort: over every 100
//! consecutive requests, exactly `weight` go to the canary pool. Within a
//! pool backends are picked round-robin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use rollgate_core::{Cohort, ServicePools};

use crate::error::TrafficError;
use crate::splitter::{SplitterProvider, TrafficSplitter};

/// A backend endpoint that can serve traffic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Backend {
    pub address: String,
    pub port: u16,
    pub healthy: bool,
}

impl Backend {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            healthy: true,
        }
    }

    /// Parse `host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, TrafficError> {
        let invalid = || TrafficError::InvalidBackend(endpoint.to_string());
        let (address, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        if address.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(address, port))
    }

    /// Full address string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Where one request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub cohort: Cohort,
    pub backend: Backend,
}

#[derive(Default)]
struct Pool {
    backends: Vec<Backend>,
    counter: AtomicUsize,
}

impl Pool {
    fn next(&self) -> Option<Backend> {
        let healthy: Vec<&Backend> = self.backends.iter().filter(|b| b.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }
}

/// Internal state for a single service.
#[derive(Default)]
struct ServiceEntry {
    stable: RwLock<Pool>,
    canary: RwLock<Pool>,
    weight: AtomicU8,
    requests: AtomicUsize,
    /// Weight writes that changed the applied weight.
    writes: AtomicU64,
}

/// Routes requests for each service to its stable or canary pool.
#[derive(Clone, Default)]
pub struct WeightedRouter {
    services: Arc<RwLock<HashMap<String, Arc<ServiceEntry>>>>,
}

impl WeightedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, service: &str) -> Option<Arc<ServiceEntry>> {
        let services = self.services.read().expect("services lock");
        services.get(service).cloned()
    }

    fn ensure_entry(&self, service: &str) -> Arc<ServiceEntry> {
        let mut services = self.services.write().expect("services lock");
        services
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "registered service");
                Arc::new(ServiceEntry::default())
            })
            .clone()
    }

    /// Register or replace one cohort's backends for a service.
    pub fn update_pool(&self, service: &str, cohort: Cohort, backends: Vec<Backend>) {
        let entry = self.ensure_entry(service);
        debug!(
            service,
            %cohort,
            count = backends.len(),
            "updated service backends"
        );
        let pool = match cohort {
            Cohort::Stable => &entry.stable,
            Cohort::Canary => &entry.canary,
        };
        *pool.write().expect("pool lock") = Pool {
            backends,
            counter: AtomicUsize::new(0),
        };
    }

    /// Register both pools of a configured service.
    pub fn register(&self, pools: &ServicePools) -> Result<(), TrafficError> {
        let parse = |endpoints: &[String]| -> Result<Vec<Backend>, TrafficError> {
            endpoints.iter().map(|e| Backend::parse(e)).collect()
        };
        let stable = parse(&pools.stable)?;
        let canary = parse(&pools.canary)?;
        self.update_pool(&pools.name, Cohort::Stable, stable);
        self.update_pool(&pools.name, Cohort::Canary, canary);
        Ok(())
    }

    /// Pick the cohort and backend for the next request to `service`.
    ///
    /// Returns `None` for an unknown service or when the chosen cohort has
    /// no healthy backend.
    pub fn route(&self, service: &str) -> Option<RouteDecision> {
        let entry = self.entry(service)?;
        let weight = entry.weight.load(Ordering::Acquire) as usize;
        let n = entry.requests.fetch_add(1, Ordering::Relaxed);

        let cohort = if n % 100 < weight {
            Cohort::Canary
        } else {
            Cohort::Stable
        };
        let pool = match cohort {
            Cohort::Stable => &entry.stable,
            Cohort::Canary => &entry.canary,
        };
        let backend = pool.read().expect("pool lock").next()?;
        Some(RouteDecision { cohort, backend })
    }

    /// Canary weight currently applied to a service.
    pub fn weight(&self, service: &str) -> Option<u8> {
        self.entry(service).map(|e| e.weight.load(Ordering::Acquire))
    }

    /// Number of writes that changed a service's weight.
    pub fn write_count(&self, service: &str) -> u64 {
        self.entry(service)
            .map(|e| e.writes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// List all registered service names.
    pub fn list_services(&self) -> Vec<String> {
        let services = self.services.read().expect("services lock");
        services.keys().cloned().collect()
    }
}

impl SplitterProvider for WeightedRouter {
    fn splitter_for(&self, workload: &str) -> Result<Arc<dyn TrafficSplitter>, TrafficError> {
        self.ensure_entry(workload);
        Ok(Arc::new(RouterSplitter {
            router: self.clone(),
            service: workload.to_string(),
        }))
    }
}

/// Splitter handle for one service of a [`WeightedRouter`].
struct RouterSplitter {
    router: WeightedRouter,
    service: String,
}

#[async_trait]
impl TrafficSplitter for RouterSplitter {
    async fn set_weight(&self, canary_percent: u8) -> Result<(), TrafficError> {
        if canary_percent > 100 {
            return Err(TrafficError::InvalidWeight(canary_percent));
        }
        let entry = self
            .router
            .entry(&self.service)
            .ok_or_else(|| TrafficError::UnknownService(self.service.clone()))?;

        let previous = entry.weight.swap(canary_percent, Ordering::AcqRel);
        if previous != canary_percent {
            entry.writes.fetch_add(1, Ordering::Relaxed);
            info!(
                service = %self.service,
                from = previous,
                to = canary_percent,
                "canary weight changed"
            );
        }
        Ok(())
    }

    fn current_weight(&self) -> u8 {
        self.router.weight(&self.service).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_pools() -> WeightedRouter {
        let router = WeightedRouter::new();
        router.update_pool(
            "voyager-gateway",
            Cohort::Stable,
            vec![Backend::new("10.0.0.1", 8080), Backend::new("10.0.0.2", 8080)],
        );
        router.update_pool(
            "voyager-gateway",
            Cohort::Canary,
            vec![Backend::new("10.0.1.1", 8080)],
        );
        router
    }

    #[test]
    fn zero_weight_routes_everything_to_stable() {
        let router = router_with_pools();
        for _ in 0..200 {
            let d = router.route("voyager-gateway").unwrap();
            assert_eq!(d.cohort, Cohort::Stable);
        }
    }

    #[tokio::test]
    async fn weight_splits_each_hundred_requests_exactly() {
        let router = router_with_pools();
        let splitter = router.splitter_for("voyager-gateway").unwrap();
        splitter.set_weight(25).await.unwrap();

        let canary = (0..400)
            .filter(|_| router.route("voyager-gateway").unwrap().cohort == Cohort::Canary)
            .count();
        assert_eq!(canary, 100);
    }

    #[tokio::test]
    async fn full_weight_routes_everything_to_canary() {
        let router = router_with_pools();
        let splitter = router.splitter_for("voyager-gateway").unwrap();
        splitter.set_weight(100).await.unwrap();

        let d = router.route("voyager-gateway").unwrap();
        assert_eq!(d.cohort, Cohort::Canary);
        assert_eq!(d.backend.endpoint(), "10.0.1.1:8080");
    }

    #[test]
    fn stable_pool_round_robins() {
        let router = router_with_pools();
        let a = router.route("voyager-gateway").unwrap().backend;
        let b = router.route("voyager-gateway").unwrap().backend;
        let c = router.route("voyager-gateway").unwrap().backend;
        assert_eq!(a.endpoint(), "10.0.0.1:8080");
        assert_eq!(b.endpoint(), "10.0.0.2:8080");
        assert_eq!(c.endpoint(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn repeated_writes_are_idempotent() {
        let router = router_with_pools();
        let splitter = router.splitter_for("voyager-gateway").unwrap();

        splitter.set_weight(10).await.unwrap();
        splitter.set_weight(10).await.unwrap();
        assert_eq!(splitter.current_weight(), 10);
        assert_eq!(router.write_count("voyager-gateway"), 1);

        splitter.set_weight(0).await.unwrap();
        assert_eq!(router.write_count("voyager-gateway"), 2);
    }

    #[tokio::test]
    async fn rejects_out_of_range_weight() {
        let router = WeightedRouter::new();
        let splitter = router.splitter_for("api").unwrap();
        assert_eq!(
            splitter.set_weight(101).await,
            Err(TrafficError::InvalidWeight(101))
        );
        assert_eq!(splitter.current_weight(), 0);
    }

    #[tokio::test]
    async fn registered_pools_receive_routed_requests() {
        let router = WeightedRouter::new();
        router
            .register(&ServicePools {
                name: "voyager-gateway".to_string(),
                stable: vec!["10.0.0.1:8080".to_string()],
                canary: vec!["canary.voyager.svc:8080".to_string()],
            })
            .unwrap();
        assert!(router.list_services().contains(&"voyager-gateway".to_string()));

        let splitter = router.splitter_for("voyager-gateway").unwrap();
        splitter.set_weight(50).await.unwrap();
        let first = router.route("voyager-gateway").unwrap();
        assert_eq!(first.cohort, Cohort::Canary);
        assert_eq!(first.backend.endpoint(), "canary.voyager.svc:8080");
        assert_eq!(router.route("voyager-gateway").unwrap().cohort, Cohort::Canary);
    }

    #[test]
    fn invalid_backend_rejects_registration() {
        let router = WeightedRouter::new();
        let err = router
            .register(&ServicePools {
                name: "api".to_string(),
                stable: vec!["10.0.0.1".to_string()],
                canary: vec![],
            })
            .unwrap_err();
        assert_eq!(err, TrafficError::InvalidBackend("10.0.0.1".to_string()));
        assert!(router.route("api").is_none());
        assert!(Backend::parse(":80").is_err());
        assert!(Backend::parse("host:http").is_err());
        assert_eq!(Backend::parse("10.0.0.1:80").unwrap(), Backend::new("10.0.0.1", 80));
    }

    #[test]
    fn unknown_service_has_no_route() {
        let router = WeightedRouter::new();
        assert!(router.route("api").is_none());
        assert_eq!(router.weight("api"), None);
    }

    #[test]
    fn empty_canary_pool_yields_no_route() {
        let router = WeightedRouter::new();
        router.update_pool("api", Cohort::Stable, vec![Backend::new("10.0.0.1", 80)]);
        let entry = router.entry("api").unwrap();
        entry.weight.store(100, Ordering::Release);
        assert!(router.route("api").is_none());
    }
}
