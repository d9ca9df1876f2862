//! HAProxy Data Plane API driver
//!
//! Staged calls go into a server-side transaction opened on first use.
//! `apply` commits it; before every commit the managed backends and
//! switching rules are captured so a later `rollback` with nothing pending
//! can stage the difference back in a fresh transaction.

use super::engine::EngineProcess;
use super::{BackendDriver, BackendSpec, DriverHealth, ValidationReport};
use crate::dataplane::{ApiError, ApiResult, DataPlaneClient, ServerObject};
use crate::error::{Result, RoutingError};
use crate::route::{Domains, LiveRoute, MatchCondition, RouteType, TargetAddress};
use crate::transaction::{StagedOp, TransactionManager, TransactionStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "server1";

/// A managed backend as seen on the server
#[derive(Debug, Clone, PartialEq)]
struct ManagedBackend {
    mode: String,
    server: Option<ServerObject>,
    /// frontend -> `cond_test`
    rules: BTreeMap<String, String>,
}

type ManagedState = BTreeMap<String, ManagedBackend>;

pub struct TransactionalDriver {
    name: String,
    client: Arc<DataPlaneClient>,
    transactions: Arc<TransactionManager>,
    http_frontend: String,
    tcp_frontend: String,
    domains: Domains,
    engine: EngineProcess,
    /// Transaction holding the staged changes
    current: Mutex<Option<String>>,
    /// Commits whose outcome was not observed
    unresolved: Mutex<Vec<String>>,
    /// Managed state captured before the last commit
    before_last_commit: Mutex<Option<ManagedState>>,
}

impl TransactionalDriver {
    pub fn new(
        client: Arc<DataPlaneClient>,
        transactions: Arc<TransactionManager>,
        http_frontend: &str,
        tcp_frontend: &str,
        domains: Domains,
        engine: EngineProcess,
    ) -> Self {
        Self {
            name: "dataplane".to_string(),
            client,
            transactions,
            http_frontend: http_frontend.to_string(),
            tcp_frontend: tcp_frontend.to_string(),
            domains,
            engine,
            current: Mutex::new(None),
            unresolved: Mutex::new(Vec::new()),
            before_last_commit: Mutex::new(None),
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Id of the transaction holding staged changes, if any
    pub fn current_transaction(&self) -> Option<String> {
        self.current.lock().clone()
    }

    fn api_error(&self, e: ApiError) -> RoutingError {
        e.into_routing(&self.name)
    }

    fn frontends(&self) -> [&str; 2] {
        [self.http_frontend.as_str(), self.tcp_frontend.as_str()]
    }

    /// Resolve commits left in UNKNOWN; open leftovers are aborted
    async fn settle_unresolved(&self) {
        let pending: Vec<String> = std::mem::take(&mut *self.unresolved.lock());
        for id in pending {
            match self.transactions.refresh(&id).await {
                Ok(TransactionStatus::Open) => {
                    if let Err(e) = self.transactions.abort(&id).await {
                        warn!(transaction_id = %id, error = %e, "Failed to abort unresolved transaction");
                    }
                }
                Ok(status) => debug!(transaction_id = %id, ?status, "Unresolved commit settled"),
                Err(e) => {
                    warn!(transaction_id = %id, error = %e, "Commit outcome still unknown");
                    self.unresolved.lock().push(id);
                }
            }
        }
    }

    async fn ensure_transaction(&self) -> Result<String> {
        if let Some(id) = self.current_transaction() {
            return Ok(id);
        }
        self.settle_unresolved().await;

        let id = self.transactions.begin_claimed().await?;
        let existing = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(existing) => Some(existing.clone()),
                None => {
                    *current = Some(id.clone());
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                if let Err(e) = self.transactions.abort(&id).await {
                    warn!(transaction_id = %id, error = %e, "Failed to abort duplicate transaction");
                }
                Ok(existing)
            }
            None => Ok(id),
        }
    }

    async fn stage(&self, op: StagedOp) -> Result<()> {
        let id = self.ensure_transaction().await?;
        let Err(e) = self.transactions.stage(&id, op).await else {
            return Ok(());
        };
        if self.transactions.status(&id).await != Some(TransactionStatus::Aborted) {
            return Err(e);
        }

        // Aborted from outside mid-mutation; start over in a fresh transaction
        {
            let mut current = self.current.lock();
            if current.as_deref() == Some(id.as_str()) {
                *current = None;
            }
        }
        warn!(transaction_id = %id, error = %e, "Transaction aborted while staging");
        Err(RoutingError::transient(&self.name, "transaction aborted while staging").with_transaction(&id))
    }

    /// Managed backends and rules, as seen inside `tx` when given
    async fn managed_state(&self, tx: Option<&str>) -> ApiResult<ManagedState> {
        let mut state = ManagedState::new();

        for frontend in self.frontends() {
            for rule in self.client.switching_rules(tx, frontend).await? {
                let Some(cond_test) = rule.cond_test else { continue };
                let managed = MatchCondition::parse_haproxy_condition(&cond_test)
                    .and_then(|cond| self.domains.key_from_service(&rule.name, &cond))
                    .is_some();
                if !managed {
                    debug!(backend = %rule.name, frontend, "Ignoring unmanaged switching rule");
                    continue;
                }
                state
                    .entry(rule.name.clone())
                    .or_insert_with(|| ManagedBackend {
                        mode: String::new(),
                        server: None,
                        rules: BTreeMap::new(),
                    })
                    .rules
                    .insert(frontend.to_string(), cond_test);
            }
        }

        let backends = self.client.backends(tx).await?;
        for (name, managed) in state.iter_mut() {
            if let Some(backend) = backends.iter().find(|b| b.name == *name) {
                managed.mode = backend.mode.clone();
                managed.server = self
                    .client
                    .servers(tx, name)
                    .await?
                    .into_iter()
                    .find(|s| s.name == SERVER_NAME);
            }
        }

        Ok(state)
    }

    async fn revert_to(&self, saved: &ManagedState) -> Result<()> {
        let current = self.managed_state(None).await.map_err(|e| self.api_error(e))?;
        let frontends: Vec<String> = self.frontends().iter().map(|f| f.to_string()).collect();
        let ops = revert_ops(saved, &current, &frontends);
        if ops.is_empty() {
            info!("Live configuration already matches the previous commit");
            return Ok(());
        }

        let id = self.transactions.begin_claimed().await?;
        let outcome = async {
            for op in ops {
                self.transactions.stage(&id, op).await?;
            }
            let report = self.transactions.validate(&id).await?;
            if !report.valid {
                return Err(RoutingError::conflict(
                    &self.name,
                    format!("revert rejected: {}", report.message.unwrap_or_default()),
                )
                .with_transaction(&id));
            }
            self.transactions.commit(&id, false).await
        }
        .await;

        if let Err(e) = &outcome {
            if e.kind() == crate::error::ErrorKind::AmbiguousState {
                self.transactions.release(&id).await;
            } else if let Err(abort_err) = self.transactions.abort(&id).await {
                warn!(transaction_id = %id, error = %abort_err, "Failed to abort revert transaction");
            }
        }
        outcome
    }
}

/// Ops that turn `current` back into `saved`
fn revert_ops(saved: &ManagedState, current: &ManagedState, frontends: &[String]) -> Vec<StagedOp> {
    let mut ops = Vec::new();

    for name in current.keys().filter(|name| !saved.contains_key(*name)) {
        for frontend in frontends {
            ops.push(StagedOp::DeleteSwitchingRules {
                frontend: frontend.clone(),
                backend: name.clone(),
            });
        }
        ops.push(StagedOp::DeleteBackend { name: name.clone() });
    }

    for (name, wanted) in saved {
        if current.get(name) == Some(wanted) {
            continue;
        }
        if let Some(server) = &wanted.server {
            ops.push(StagedOp::PutBackend {
                name: name.clone(),
                mode: wanted.mode.clone(),
                server: server.clone(),
            });
        }
        for frontend in frontends {
            match wanted.rules.get(frontend) {
                Some(cond_test) => ops.push(StagedOp::PutSwitchingRule {
                    frontend: frontend.clone(),
                    backend: name.clone(),
                    cond_test: cond_test.clone(),
                }),
                None => ops.push(StagedOp::DeleteSwitchingRules {
                    frontend: frontend.clone(),
                    backend: name.clone(),
                }),
            }
        }
    }

    ops
}

fn server_for(spec: &BackendSpec) -> Result<ServerObject> {
    let address = match spec.protocol {
        RouteType::Http => {
            let url = reqwest::Url::parse(&spec.target)
                .map_err(|e| RoutingError::validation(format!("invalid target URL '{}': {}", spec.target, e)))?;
            if !matches!(url.path(), "" | "/") {
                return Err(RoutingError::validation(format!(
                    "target '{}' has a path; HAProxy servers forward to host:port only",
                    spec.target
                )));
            }
            TargetAddress::from_http_url(&spec.target)?
        }
        RouteType::Tcp => TargetAddress::from_host_port(&spec.target)?,
    };

    Ok(ServerObject {
        name: SERVER_NAME.to_string(),
        ssl: Some((if address.tls { "enabled" } else { "disabled" }).to_string()),
        verify: address.tls.then(|| "none".to_string()),
        port: Some(address.port),
        address: address.host,
    })
}

fn server_target(route_type: RouteType, server: &ServerObject) -> Option<String> {
    let port = server.port?;
    let address = TargetAddress {
        host: server.address.clone(),
        port,
        tls: server.ssl.as_deref() == Some("enabled"),
    };
    Some(match route_type {
        RouteType::Http => address.url(),
        RouteType::Tcp => address.host_port(),
    })
}

#[async_trait]
impl BackendDriver for TransactionalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn frontend_id(&self, route_type: RouteType) -> &str {
        match route_type {
            RouteType::Http => &self.http_frontend,
            RouteType::Tcp => &self.tcp_frontend,
        }
    }

    async fn stage_add_backend(&self, name: &str, spec: &BackendSpec) -> Result<()> {
        let server = server_for(spec)?;
        self.stage(StagedOp::PutBackend {
            name: name.to_string(),
            mode: spec.protocol.as_str().to_string(),
            server,
        })
        .await
    }

    async fn stage_frontend_rule(
        &self,
        frontend_id: &str,
        backend_name: &str,
        condition: &MatchCondition,
        rule_id: &str,
    ) -> Result<()> {
        debug!(frontend = frontend_id, backend = backend_name, rule = rule_id, "Staging switching rule");
        self.stage(StagedOp::PutSwitchingRule {
            frontend: frontend_id.to_string(),
            backend: backend_name.to_string(),
            cond_test: condition.haproxy_condition(),
        })
        .await
    }

    async fn stage_remove_backend(&self, name: &str) -> Result<()> {
        for frontend in self.frontends() {
            self.stage(StagedOp::DeleteSwitchingRules {
                frontend: frontend.to_string(),
                backend: name.to_string(),
            })
            .await?;
        }
        self.stage(StagedOp::DeleteBackend { name: name.to_string() }).await
    }

    async fn validate(&self) -> Result<ValidationReport> {
        let Some(id) = self.current_transaction() else {
            return Ok(ValidationReport::ok());
        };
        self.transactions.validate(&id).await
    }

    async fn apply(&self) -> Result<()> {
        let Some(id) = self.current_transaction() else {
            return Ok(());
        };

        let snapshot = self
            .managed_state(None)
            .await
            .map_err(|e| self.api_error(e).with_transaction(&id))?;

        match self.transactions.commit(&id, false).await {
            Ok(()) => {
                *self.current.lock() = None;
                *self.before_last_commit.lock() = Some(snapshot);
                Ok(())
            }
            Err(e) if e.kind() == crate::error::ErrorKind::AmbiguousState => {
                *self.current.lock() = None;
                self.transactions.release(&id).await;
                self.unresolved.lock().push(id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let pending = self.current.lock().take();
        if let Some(id) = pending {
            return self.transactions.abort(&id).await;
        }

        let saved = self.before_last_commit.lock().clone();
        let Some(saved) = saved else {
            return Err(RoutingError::backend(&self.name, "no committed change to revert"));
        };

        self.revert_to(&saved).await?;
        *self.before_last_commit.lock() = None;
        warn!("Reverted managed configuration to its state before the last commit");
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.current.lock().is_some()
    }

    async fn check_health(&self) -> DriverHealth {
        let mut last_error = None;

        let process_running = match self.engine.is_running().await {
            Some(running) => running,
            None => match self.client.runtime_info().await {
                Ok(_) => true,
                Err(e) => {
                    last_error = Some(format!("runtime info unavailable: {}", e));
                    false
                }
            },
        };

        let config_valid = match self.client.raw_configuration(None).await {
            Ok(raw) => match self.client.validate_raw(&raw).await {
                Ok(()) => true,
                Err(e) => {
                    last_error = Some(format!("live configuration invalid: {}", e));
                    false
                }
            },
            Err(e) => {
                last_error.get_or_insert_with(|| format!("configuration unavailable: {}", e));
                false
            }
        };

        if last_error.is_none() && !process_running {
            last_error = Some("engine process is not running".to_string());
        }

        DriverHealth {
            process_running,
            config_valid,
            last_error,
        }
    }

    async fn load_routes(&self) -> Result<Vec<LiveRoute>> {
        let state = self.managed_state(None).await.map_err(|e| self.api_error(e))?;
        let mut routes = Vec::new();

        for (name, managed) in &state {
            let Some(server) = &managed.server else {
                debug!(backend = %name, "Managed backend has no server");
                continue;
            };
            for cond_test in managed.rules.values() {
                let Some(cond) = MatchCondition::parse_haproxy_condition(cond_test) else {
                    continue;
                };
                let Some(key) = self.domains.key_from_service(name, &cond) else {
                    continue;
                };
                let Some(target) = server_target(key.route_type, server) else {
                    continue;
                };
                routes.push(LiveRoute {
                    use_tls: cond.uses_tls(),
                    key,
                    target,
                });
            }
        }

        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes.dedup_by(|a, b| a.key == b.key);
        Ok(routes)
    }

    async fn restart(&self) -> Result<()> {
        self.engine.restart().await
    }
}
