//! Config applier
//!
//! The only writer of the [`RouteRegistry`]. Each mutation stages its change
//! through the driver, validates, applies and then updates the registry;
//! on any failure the registry is left as it was.
//!
//! Lock order is backend-wide lock (shared), then the route-key lock, then
//! the driver apply gate. Repairs take the backend-wide lock exclusively.

use crate::driver::{BackendDriver, BackendSpec};
use crate::error::{ErrorKind, Result, RoutingError};
use crate::registry::RouteRegistry;
use crate::retry::{retry, Retry, RetryPolicy};
use crate::route::{DesiredState, Domains, LiveRoute, MatchCondition, Route, RouteKey};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Proof that the backend-wide lock is held exclusively
pub struct RepairGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Registry routes compared against the live configuration
    pub checked: usize,
    /// Routes whose live construct was missing or different
    pub restaged: Vec<String>,
}

#[derive(Debug, Clone)]
enum Mutation {
    Add {
        spec: BackendSpec,
        condition: MatchCondition,
    },
    Remove,
}

fn classify(err: &RoutingError) -> Retry {
    if err.is_transient() {
        Retry::Transient
    } else {
        Retry::Fatal
    }
}

pub struct ConfigApplier {
    driver: Arc<dyn BackendDriver>,
    registry: Arc<RouteRegistry>,
    domains: Domains,
    policy: RetryPolicy,
    call_timeout: Duration,
    backend_lock: RwLock<()>,
    key_locks: DashMap<RouteKey, Arc<Mutex<()>>>,
    apply_gate: Mutex<()>,
}

impl ConfigApplier {
    pub fn new(
        driver: Arc<dyn BackendDriver>,
        registry: Arc<RouteRegistry>,
        domains: Domains,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            registry,
            domains,
            policy,
            call_timeout,
            backend_lock: RwLock::new(()),
            key_locks: DashMap::new(),
            apply_gate: Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn BackendDriver> {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn domains(&self) -> &Domains {
        &self.domains
    }

    /// Block new mutations until the guard is dropped
    pub async fn begin_repair(&self) -> RepairGuard<'_> {
        RepairGuard {
            _guard: self.backend_lock.write().await,
        }
    }

    fn key_lock(&self, key: &RouteKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_key_lock(&self, key: &RouteKey) {
        self.key_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Bound a driver call; a timeout counts as transient
    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RoutingError::transient(
                self.driver.name(),
                format!("{} timed out after {}ms", what, self.call_timeout.as_millis()),
            )),
        }
    }

    /// Bound `apply`; a timeout leaves the outcome unknown
    async fn call_apply(&self) -> Result<()> {
        match tokio::time::timeout(self.call_timeout, self.driver.apply()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == ErrorKind::TransientBackend => {
                // The request may have landed; only a re-read can tell
                Err(RoutingError::ambiguous(self.driver.name(), e.message().to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RoutingError::ambiguous(
                self.driver.name(),
                format!("apply timed out after {}ms", self.call_timeout.as_millis()),
            )),
        }
    }

    async fn discard_pending(&self) {
        if !self.driver.has_pending() {
            return;
        }
        if let Err(e) = self.call("rollback", self.driver.rollback()).await {
            warn!(backend = self.driver.name(), error = %e, "Failed to discard staged changes");
        }
    }

    async fn stage(&self, key: &RouteKey, mutation: &Mutation) -> Result<()> {
        let service = key.service_name();
        match mutation {
            Mutation::Add { spec, condition } => {
                self.call("stage_add_backend", self.driver.stage_add_backend(&service, spec))
                    .await?;
                let frontend = self.driver.frontend_id(key.route_type).to_string();
                self.call(
                    "stage_frontend_rule",
                    self.driver
                        .stage_frontend_rule(&frontend, &service, condition, &key.router_name()),
                )
                .await
            }
            Mutation::Remove => {
                self.call("stage_remove_backend", self.driver.stage_remove_backend(&service))
                    .await
            }
        }
    }

    async fn validate_and_apply(&self) -> Result<()> {
        let report = self.call("validate", self.driver.validate()).await?;
        if !report.valid {
            return Err(RoutingError::conflict(
                self.driver.name(),
                format!(
                    "staged configuration rejected: {}",
                    report.message.unwrap_or_else(|| "no details".to_string())
                ),
            ));
        }
        self.call_apply().await
    }

    /// One stage → validate → apply pass under the apply gate
    async fn attempt(&self, key: &RouteKey, desired: &DesiredState, mutation: &Mutation) -> Result<()> {
        let _gate = self.apply_gate.lock().await;

        let result = match self.stage(key, mutation).await {
            Ok(()) => self.validate_and_apply().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AmbiguousState => {
                self.discard_pending().await;
                self.resolve_ambiguous(key, desired, e).await
            }
            Err(e) => {
                self.discard_pending().await;
                Err(e)
            }
        }
    }

    /// Decide from live state whether an ambiguous apply took effect
    async fn resolve_ambiguous(&self, key: &RouteKey, desired: &DesiredState, cause: RoutingError) -> Result<()> {
        warn!(route = %key, error = %cause, "Apply outcome unknown, re-reading backend");

        let live = match self.call("load_routes", self.driver.load_routes()).await {
            Ok(live) => live,
            Err(e) => {
                error!(route = %key, error = %e, "Re-read after ambiguous apply failed");
                let mut err = RoutingError::ambiguous(
                    self.driver.name(),
                    format!("{}; re-read failed: {}", cause.message(), e.message()),
                );
                if let Some(id) = cause.transaction_id() {
                    err = err.with_transaction(id);
                }
                return Err(err);
            }
        };

        if desired.is_satisfied_by(live.iter().find(|r| r.key == *key)) {
            info!(route = %key, "Ambiguous apply took effect");
            Ok(())
        } else {
            Err(RoutingError::transient(
                self.driver.name(),
                format!("apply did not take effect: {}", cause.message()),
            ))
        }
    }

    async fn mutate(&self, key: &RouteKey, desired: DesiredState, mutation: Mutation) -> Result<()> {
        let op_id = Uuid::new_v4();
        debug!(%op_id, route = %key, ?desired, "Applying mutation");

        let outcome = retry(&self.policy, classify, |attempt| {
            if attempt > 1 {
                debug!(%op_id, route = %key, attempt, "Retrying mutation");
            }
            self.attempt(key, &desired, &mutation)
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => {
                let mut err = failure.error.with_route(key);
                if failure.exhausted {
                    err = err.with_attempts(failure.attempts);
                }
                warn!(%op_id, route = %key, error = %err, "Mutation failed");
                Err(err)
            }
        }
    }

    /// Create or replace the route for `key`
    pub async fn add(&self, key: RouteKey, target: &str, use_tls: bool) -> Result<Route> {
        let _shared = self.backend_lock.read().await;
        let key_lock = self.key_lock(&key);
        let result = {
            let _key_guard = key_lock.lock().await;

            let mutation = Mutation::Add {
                spec: BackendSpec {
                    protocol: key.route_type,
                    target: target.to_string(),
                    use_tls,
                },
                condition: self.domains.match_condition(&key, use_tls),
            };
            let desired = DesiredState::Present {
                target: target.to_string(),
                use_tls,
            };

            match self.mutate(&key, desired, mutation).await {
                Ok(()) => {
                    let route = self
                        .registry
                        .upsert(Route::new(key.clone(), target, use_tls, &self.domains));
                    info!(route = %key, target = %target, use_tls, domain = %route.domain, "Route applied");
                    Ok(route)
                }
                Err(e) => Err(e),
            }
        };
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    /// Remove the route for `key`; `false` when it did not exist
    pub async fn remove(&self, key: &RouteKey) -> Result<bool> {
        let _shared = self.backend_lock.read().await;
        let key_lock = self.key_lock(key);
        let result = {
            let _key_guard = key_lock.lock().await;

            if !self.registry.exists(key) {
                debug!(route = %key, "Route not registered, nothing to remove");
                Ok(false)
            } else {
                match self.mutate(key, DesiredState::Absent, Mutation::Remove).await {
                    Ok(()) => {
                        self.registry.remove(key);
                        info!(route = %key, "Route removed");
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        drop(key_lock);
        self.release_key_lock(key);
        result
    }

    async fn load_live(&self) -> Result<Vec<LiveRoute>> {
        retry(&self.policy, classify, |_| self.call("load_routes", self.driver.load_routes()))
            .await
            .map_err(|failure| failure.error)
    }

    async fn resync_registry(&self) -> Result<usize> {
        let live = {
            let _gate = self.apply_gate.lock().await;
            self.load_live().await?
        };

        let routes: Vec<Route> = live
            .into_iter()
            .map(|l| {
                let mut route = Route::new(l.key.clone(), &l.target, l.use_tls, &self.domains);
                if let Some(existing) = self.registry.get(&l.key) {
                    route.created_at = existing.created_at;
                    if existing.matches_live(&l) {
                        route.last_updated = existing.last_updated;
                    }
                }
                route
            })
            .collect();

        let count = routes.len();
        self.registry.replace_all(routes);
        info!(backend = self.driver.name(), routes = count, "Registry rebuilt from live configuration");
        Ok(count)
    }

    /// Rebuild the registry from the live backend
    pub async fn resync(&self) -> Result<usize> {
        let _shared = self.backend_lock.read().await;
        self.resync_registry().await
    }

    /// Re-stage registry routes whose live construct is missing or different
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _shared = self.backend_lock.read().await;
        self.reconcile_registry().await
    }

    /// [`reconcile`](Self::reconcile) for callers already holding the repair lock
    pub async fn reconcile_during_repair(&self, _repair: &RepairGuard<'_>) -> Result<ReconcileReport> {
        self.reconcile_registry().await
    }

    async fn reconcile_registry(&self) -> Result<ReconcileReport> {
        let outcome = retry(&self.policy, classify, |_| self.reconcile_once()).await;
        match outcome {
            Ok(report) => {
                if !report.restaged.is_empty() {
                    info!(restaged = report.restaged.len(), "Drifted routes restaged");
                }
                Ok(report)
            }
            Err(failure) if failure.exhausted => Err(failure.error.with_attempts(failure.attempts)),
            Err(failure) => Err(failure.error),
        }
    }

    async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let _gate = self.apply_gate.lock().await;

        let live: HashMap<RouteKey, LiveRoute> = self
            .call("load_routes", self.driver.load_routes())
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let routes = self.registry.get_all();
        let drifted: Vec<&Route> = routes
            .iter()
            .filter(|route| live.get(&route.key).map_or(true, |l| !route.matches_live(l)))
            .collect();

        let mut report = ReconcileReport {
            checked: routes.len(),
            restaged: Vec::new(),
        };
        if drifted.is_empty() {
            return Ok(report);
        }

        let result = async {
            for route in &drifted {
                debug!(route = %route.key, "Restaging drifted route");
                let mutation = Mutation::Add {
                    spec: BackendSpec {
                        protocol: route.key.route_type,
                        target: route.target.clone(),
                        use_tls: route.use_tls,
                    },
                    condition: self.domains.match_condition(&route.key, route.use_tls),
                };
                self.stage(&route.key, &mutation).await?;
            }
            self.validate_and_apply().await
        }
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AmbiguousState => {
                // The next reconcile pass re-reads and restages what is still missing
                self.discard_pending().await;
                return Err(RoutingError::transient(self.driver.name(), e.message().to_string()));
            }
            Err(e) => {
                self.discard_pending().await;
                return Err(e);
            }
        }

        report.restaged = drifted.iter().map(|r| r.key.to_string()).collect();
        Ok(report)
    }
}
