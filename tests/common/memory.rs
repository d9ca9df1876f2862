//! Driver keeping its "live" configuration in memory, with health knobs

use async_trait::async_trait;
use parking_lot::Mutex;
use routekeeper::driver::{BackendDriver, BackendSpec, DriverHealth, ValidationReport};
use routekeeper::error::{Result, RoutingError};
use routekeeper::route::{Domains, LiveRoute, MatchCondition, RouteType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Clone)]
struct Construct {
    spec: BackendSpec,
    condition: Option<MatchCondition>,
}

pub struct MemoryDriver {
    domains: Domains,
    live: Mutex<BTreeMap<String, Construct>>,
    staged: Mutex<Option<BTreeMap<String, Construct>>>,
    /// Engine process alive
    pub running: AtomicBool,
    /// Live configuration damaged; any successful apply rewrites it
    pub corrupted: AtomicBool,
    /// A restart brings the engine back up
    pub restart_heals: AtomicBool,
    pub reject_validation: AtomicBool,
    pub applies: AtomicU32,
    pub rollbacks: AtomicU32,
    pub restarts: AtomicU32,
}

impl MemoryDriver {
    pub fn new(domains: Domains) -> Self {
        Self {
            domains,
            live: Mutex::new(BTreeMap::new()),
            staged: Mutex::new(None),
            running: AtomicBool::new(true),
            corrupted: AtomicBool::new(false),
            restart_heals: AtomicBool::new(true),
            reject_validation: AtomicBool::new(false),
            applies: AtomicU32::new(0),
            rollbacks: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn live_services(&self) -> Vec<String> {
        self.live.lock().keys().cloned().collect()
    }

    /// Drop a service from the live configuration behind the control plane's back
    pub fn forget(&self, service: &str) {
        self.live.lock().remove(service);
    }

    fn edit(&self, edit: impl FnOnce(&mut BTreeMap<String, Construct>)) {
        let mut staged = self.staged.lock();
        let doc = staged.get_or_insert_with(|| self.live.lock().clone());
        edit(doc);
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn frontend_id(&self, route_type: RouteType) -> &str {
        match route_type {
            RouteType::Http => "web",
            RouteType::Tcp => "mongodb",
        }
    }

    async fn stage_add_backend(&self, name: &str, spec: &BackendSpec) -> Result<()> {
        self.edit(|doc| {
            let condition = doc.get(name).and_then(|c| c.condition.clone());
            doc.insert(
                name.to_string(),
                Construct {
                    spec: spec.clone(),
                    condition,
                },
            );
        });
        Ok(())
    }

    async fn stage_frontend_rule(
        &self,
        _frontend_id: &str,
        backend_name: &str,
        condition: &MatchCondition,
        _rule_id: &str,
    ) -> Result<()> {
        let mut missing = false;
        self.edit(|doc| match doc.get_mut(backend_name) {
            Some(construct) => construct.condition = Some(condition.clone()),
            None => missing = true,
        });
        if missing {
            return Err(RoutingError::conflict("memory", format!("unknown backend {}", backend_name)));
        }
        Ok(())
    }

    async fn stage_remove_backend(&self, name: &str) -> Result<()> {
        self.edit(|doc| {
            doc.remove(name);
        });
        Ok(())
    }

    async fn validate(&self) -> Result<ValidationReport> {
        if self.reject_validation.load(Ordering::SeqCst) {
            return Ok(ValidationReport::invalid("rejected by test"));
        }
        Ok(ValidationReport::ok())
    }

    async fn apply(&self) -> Result<()> {
        let staged = self.staged.lock().take();
        if let Some(doc) = staged {
            *self.live.lock() = doc;
            self.corrupted.store(false, Ordering::SeqCst);
            self.applies.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.staged.lock().take();
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.staged.lock().is_some()
    }

    async fn check_health(&self) -> DriverHealth {
        let process_running = self.running.load(Ordering::SeqCst);
        let config_valid = !self.corrupted.load(Ordering::SeqCst);
        let last_error = match (process_running, config_valid) {
            (false, _) => Some("engine process is not running".to_string()),
            (true, false) => Some("live configuration invalid".to_string()),
            (true, true) => None,
        };
        DriverHealth {
            process_running,
            config_valid,
            last_error,
        }
    }

    async fn load_routes(&self) -> Result<Vec<LiveRoute>> {
        let live = self.live.lock();
        Ok(live
            .iter()
            .filter_map(|(name, construct)| {
                let condition = construct.condition.as_ref()?;
                let key = self.domains.key_from_service(name, condition)?;
                Some(LiveRoute {
                    key,
                    target: construct.spec.target.clone(),
                    use_tls: condition.uses_tls(),
                })
            })
            .collect())
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.restart_heals.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(RoutingError::backend("memory", "restart command failed"))
        }
    }
}
