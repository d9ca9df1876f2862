//! Routing façade consumed by the API layer

use crate::applier::{ConfigApplier, ReconcileReport};
use crate::driver::BackendDriver;
use crate::error::{Result, RoutingError};
use crate::health::{HealthMonitor, HealthSnapshot, RepairResult};
use crate::registry::{RegistryStats, RouteRegistry};
use crate::route::{normalize_http_target, normalize_tcp_target, Route, RouteKey, RouteType};
use crate::transaction::{CleanupReport, TransactionManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRouteOptions {
    /// Scheme prepended to a bare `host:port` target
    pub protocol: String,
    /// Terminate TLS on the public side
    pub use_tls: bool,
}

impl Default for HttpRouteOptions {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            use_tls: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRouteOptions {
    /// Forward TLS untouched (SNI passthrough)
    pub use_tls: bool,
}

impl Default for TcpRouteOptions {
    fn default() -> Self {
        Self { use_tls: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub driver: String,
    pub routes: RegistryStats,
    pub health: HealthSnapshot,
}

struct Wired {
    applier: Arc<ConfigApplier>,
    health: Arc<HealthMonitor>,
    transactions: Option<Arc<TransactionManager>>,
}

pub struct RoutingService {
    registry: Arc<RouteRegistry>,
    wired: Option<Wired>,
}

impl RoutingService {
    /// Service backed by a driver
    pub fn new(applier: Arc<ConfigApplier>, health: Arc<HealthMonitor>) -> Self {
        Self {
            registry: applier.registry().clone(),
            wired: Some(Wired {
                applier,
                health,
                transactions: None,
            }),
        }
    }

    /// Service without a driver; every routing operation fails with
    /// `DRIVER_UNAVAILABLE`
    pub fn unavailable(registry: Arc<RouteRegistry>) -> Self {
        Self { registry, wired: None }
    }

    /// Expose transaction cleanup for a transactional driver
    pub fn with_transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        if let Some(wired) = self.wired.as_mut() {
            wired.transactions = Some(transactions);
        }
        self
    }

    fn wired(&self) -> Result<&Wired> {
        self.wired.as_ref().ok_or_else(RoutingError::driver_unavailable)
    }

    pub fn driver(&self) -> Option<&Arc<dyn BackendDriver>> {
        self.wired.as_ref().map(|w| w.applier.driver())
    }

    pub fn health_monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.wired.as_ref().map(|w| &w.health)
    }

    /// Populate the registry from the live configuration
    pub async fn initialize(&self) -> Result<usize> {
        let wired = self.wired()?;
        let count = wired.applier.resync().await?;
        info!(routes = count, driver = wired.applier.driver().name(), "Routing service initialized");
        Ok(count)
    }

    pub async fn add_http_route(
        &self,
        agent_id: &str,
        subdomain: &str,
        target_url: &str,
        opts: HttpRouteOptions,
    ) -> Result<Route> {
        let wired = self.wired()?;
        let key = RouteKey::parse(RouteType::Http, agent_id, subdomain)?;
        let target = normalize_http_target(target_url, &opts.protocol).map_err(|e| e.with_route(&key))?;
        wired.applier.add(key, &target, opts.use_tls).await
    }

    pub async fn add_tcp_route(
        &self,
        agent_id: &str,
        target_host: &str,
        target_port: u16,
        opts: TcpRouteOptions,
    ) -> Result<Route> {
        let wired = self.wired()?;
        let key = RouteKey::parse(RouteType::Tcp, agent_id, "")?;
        let target = normalize_tcp_target(target_host, target_port).map_err(|e| e.with_route(&key))?;
        wired.applier.add(key, &target, opts.use_tls).await
    }

    /// `false` when no such route existed
    pub async fn remove_route(&self, agent_id: &str, subdomain: &str, route_type: RouteType) -> Result<bool> {
        let wired = self.wired()?;
        let key = RouteKey::parse(route_type, agent_id, subdomain)?;
        wired.applier.remove(&key).await
    }

    pub fn get_agent_routes(&self, agent_id: &str) -> Result<Vec<Route>> {
        self.wired()?;
        Ok(self.registry.get_by_agent(&agent_id.trim().to_lowercase()))
    }

    pub fn get_all_routes(&self) -> Result<Vec<Route>> {
        self.wired()?;
        Ok(self.registry.get_all())
    }

    pub async fn check_health(&self, force_refresh: bool) -> Result<HealthSnapshot> {
        Ok(self.wired()?.health.check(force_refresh).await)
    }

    pub async fn repair(&self) -> Result<RepairResult> {
        self.wired()?.health.repair().await
    }

    pub fn clear_alert(&self) -> Result<()> {
        self.wired()?.health.clear_alert();
        Ok(())
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.wired()?.applier.reconcile().await
    }

    /// Abort stale transactions; a no-op report for drivers without transactions
    pub async fn cleanup_transactions(&self, max_age: Duration, all: bool) -> Result<CleanupReport> {
        let wired = self.wired()?;
        match &wired.transactions {
            Some(transactions) => transactions.cleanup(max_age, all).await,
            None => Ok(CleanupReport::default()),
        }
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let wired = self.wired()?;
        Ok(ServiceStats {
            driver: wired.applier.driver().name().to_string(),
            routes: self.registry.stats(),
            health: wired.health.check(false).await,
        })
    }
}
