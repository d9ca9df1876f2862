//! Backend health monitoring and self-repair
//!
//! ```text
//!            fail               fail x threshold
//! HEALTHY ─────────▶ DEGRADED ─────────────────▶ UNHEALTHY ──▶ repair ladder
//!    ▲                   │                           │
//!    └────── ok ─────────┴───────────── ok ──────────┘
//! ```
//!
//! The ladder first restores the last committed configuration: pending
//! staged work is discarded and the backend is reconciled to the registry,
//! which only ever records applied changes. When the live configuration is
//! too broken to reconcile, the driver's previous committed copy is restored
//! and reconciled instead. Then the engine is restarted; last of all a
//! standing alert is raised. Each rung is tried at most once per cooldown
//! window. Repairs hold the applier's backend-wide lock exclusively.

use crate::applier::{ConfigApplier, RepairGuard};
use crate::config::HealthConfig;
use crate::driver::DriverHealth;
use crate::error::{Result, RoutingError};
use crate::probe::{all_reachable, ReachabilityProbe};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub state: HealthState,
    pub process_running: bool,
    pub config_valid: bool,
    /// `None` when no reachability probes are configured
    pub reachable: Option<bool>,
    pub last_error: Option<String>,
    pub route_count: usize,
    pub consecutive_failures: u32,
    /// Standing alert after the repair ladder ran out
    pub alert: Option<String>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Discard staged work left behind by an interrupted mutation
    Rollback,
    /// Rewrite the backend to match the registry
    Reconcile,
    Restart,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairStep {
    pub action: RepairAction,
    pub success: bool,
    pub message: Option<String>,
}

impl RepairStep {
    fn ok(action: RepairAction) -> Self {
        Self {
            action,
            success: true,
            message: None,
        }
    }

    fn failed(action: RepairAction, message: impl Into<String>) -> Self {
        Self {
            action,
            success: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairResult {
    /// Backend healthy after the repair
    pub success: bool,
    pub steps: Vec<RepairStep>,
    pub snapshot: HealthSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Rung {
    Rollback,
    Restart,
}

struct MonitorState {
    state: HealthState,
    consecutive_failures: u32,
    cached: Option<(Instant, HealthSnapshot)>,
    last_healthy: Option<HealthSnapshot>,
    rung_attempts: HashMap<Rung, Instant>,
    alert: Option<(Instant, String)>,
}

pub struct HealthMonitor {
    applier: Arc<ConfigApplier>,
    probe: Option<ReachabilityProbe>,
    interval: Duration,
    cache_ttl: Duration,
    unhealthy_threshold: u32,
    cooldown: Duration,
    auto_repair: bool,
    call_timeout: Duration,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(
        applier: Arc<ConfigApplier>,
        probe: Option<ReachabilityProbe>,
        config: &HealthConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            applier,
            probe: probe.filter(|p| !p.is_empty()),
            interval: config.interval(),
            cache_ttl: config.cache_ttl(),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            cooldown: config.repair_cooldown(),
            auto_repair: config.auto_repair,
            call_timeout,
            state: Mutex::new(MonitorState {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                cached: None,
                last_healthy: None,
                rung_attempts: HashMap::new(),
                alert: None,
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state.lock().state
    }

    /// Last snapshot observed while healthy
    pub fn last_known_good(&self) -> Option<HealthSnapshot> {
        self.state.lock().last_healthy.clone()
    }

    pub fn alert(&self) -> Option<String> {
        self.state.lock().alert.as_ref().map(|(_, message)| message.clone())
    }

    /// Drop a standing alert and forget rung attempts so the ladder restarts
    pub fn clear_alert(&self) {
        let mut state = self.state.lock();
        if state.alert.take().is_some() {
            info!("Standing health alert cleared");
        }
        state.rung_attempts.clear();
    }

    async fn probe_driver(&self) -> (DriverHealth, Option<bool>) {
        let driver = self.applier.driver();
        let health = match tokio::time::timeout(self.call_timeout, driver.check_health()).await {
            Ok(health) => health,
            Err(_) => DriverHealth {
                process_running: false,
                config_valid: false,
                last_error: Some(format!(
                    "health check timed out after {}ms",
                    self.call_timeout.as_millis()
                )),
            },
        };

        let reachable = match &self.probe {
            Some(probe) => probe.check().await.map(|results| {
                for failed in results.iter().filter(|r| !r.reachable) {
                    debug!(target = %failed.target, error = ?failed.error, "Reachability probe failed");
                }
                all_reachable(&results)
            }),
            None => None,
        };

        (health, reachable)
    }

    /// Current health; served from cache within the TTL unless `force_refresh`
    pub async fn check(&self, force_refresh: bool) -> HealthSnapshot {
        if !force_refresh {
            let state = self.state.lock();
            if let Some((at, snapshot)) = &state.cached {
                if at.elapsed() < self.cache_ttl {
                    return snapshot.clone();
                }
            }
        }

        let (health, reachable) = self.probe_driver().await;
        let healthy = health.is_healthy() && reachable != Some(false);
        let route_count = self.applier.registry().len();

        let mut state = self.state.lock();
        let previous = state.state;
        if healthy {
            state.consecutive_failures = 0;
            state.state = HealthState::Healthy;
        } else {
            state.consecutive_failures += 1;
            state.state = if state.consecutive_failures >= self.unhealthy_threshold {
                HealthState::Unhealthy
            } else {
                HealthState::Degraded
            };
        }

        let last_error = health.last_error.or_else(|| {
            (reachable == Some(false)).then(|| "routes unreachable through the proxy".to_string())
        });

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            state: state.state,
            process_running: health.process_running,
            config_valid: health.config_valid,
            reachable,
            last_error,
            route_count,
            consecutive_failures: state.consecutive_failures,
            alert: state.alert.as_ref().map(|(_, m)| m.clone()),
        };

        if previous != state.state {
            match state.state {
                HealthState::Healthy => info!(from = ?previous, "Backend healthy"),
                HealthState::Degraded => warn!(
                    failures = state.consecutive_failures,
                    error = ?snapshot.last_error,
                    "Backend degraded"
                ),
                HealthState::Unhealthy => error!(
                    failures = state.consecutive_failures,
                    error = ?snapshot.last_error,
                    "Backend unhealthy"
                ),
            }
        }

        if healthy {
            state.last_healthy = Some(snapshot.clone());
        }
        state.cached = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Whether a rung may run now, recording the attempt when it may
    fn claim_rung(&self, rung: Rung) -> bool {
        let mut state = self.state.lock();
        match state.rung_attempts.get(&rung) {
            Some(at) if at.elapsed() < self.cooldown => false,
            _ => {
                state.rung_attempts.insert(rung, Instant::now());
                true
            }
        }
    }

    async fn reconcile_step(&self, repair: &RepairGuard<'_>) -> RepairStep {
        match self.applier.reconcile_during_repair(repair).await {
            Ok(report) => RepairStep {
                action: RepairAction::Reconcile,
                success: true,
                message: Some(format!("{} of {} routes restaged", report.restaged.len(), report.checked)),
            },
            Err(e) => RepairStep::failed(RepairAction::Reconcile, e.to_string()),
        }
    }

    async fn run_ladder(&self) -> RepairResult {
        let repair = self.applier.begin_repair().await;
        let driver = self.applier.driver();
        let mut steps = Vec::new();

        if self.claim_rung(Rung::Rollback) {
            if self.last_known_good().is_none() {
                steps.push(RepairStep::failed(
                    RepairAction::Rollback,
                    "skipped: no healthy configuration observed yet",
                ));
            } else {
                warn!(backend = driver.name(), "Repair: restoring last committed configuration");
                if driver.has_pending() {
                    match tokio::time::timeout(self.call_timeout, driver.rollback()).await {
                        Ok(Ok(())) => steps.push(RepairStep::ok(RepairAction::Rollback)),
                        Ok(Err(e)) => steps.push(RepairStep::failed(RepairAction::Rollback, e.to_string())),
                        Err(_) => steps.push(RepairStep::failed(RepairAction::Rollback, "rollback timed out")),
                    }
                }
                steps.push(self.reconcile_step(&repair).await);

                let snapshot = self.check(true).await;
                if snapshot.is_healthy() {
                    info!("Repair: rollback restored health");
                    return RepairResult {
                        success: true,
                        steps,
                        snapshot,
                    };
                }

                // Live configuration itself is broken: restore the previous
                // committed copy, then bring it up to the registry again
                if !driver.has_pending() {
                    warn!(backend = driver.name(), "Repair: restoring previous committed configuration");
                    match tokio::time::timeout(self.call_timeout, driver.rollback()).await {
                        Ok(Ok(())) => {
                            steps.push(RepairStep::ok(RepairAction::Rollback));
                            steps.push(self.reconcile_step(&repair).await);
                        }
                        Ok(Err(e)) => steps.push(RepairStep::failed(RepairAction::Rollback, e.to_string())),
                        Err(_) => steps.push(RepairStep::failed(RepairAction::Rollback, "rollback timed out")),
                    }

                    let snapshot = self.check(true).await;
                    if snapshot.is_healthy() {
                        info!("Repair: restored configuration is healthy");
                        return RepairResult {
                            success: true,
                            steps,
                            snapshot,
                        };
                    }
                }
            }
        }

        if self.claim_rung(Rung::Restart) {
            warn!(backend = driver.name(), "Repair: restarting engine");
            match driver.restart().await {
                Ok(()) => steps.push(RepairStep::ok(RepairAction::Restart)),
                Err(e) => steps.push(RepairStep::failed(RepairAction::Restart, e.to_string())),
            }

            let snapshot = self.check(true).await;
            if snapshot.is_healthy() {
                info!("Repair: restart restored health");
                return RepairResult {
                    success: true,
                    steps,
                    snapshot,
                };
            }
        }

        let message = format!(
            "repair ladder exhausted for backend '{}'; operator action required",
            driver.name()
        );
        error!(backend = driver.name(), "Repair ladder exhausted, raising alert");
        self.state.lock().alert = Some((Instant::now(), message.clone()));
        steps.push(RepairStep::failed(RepairAction::Alert, message));

        drop(repair);
        let snapshot = self.check(true).await;
        RepairResult {
            success: false,
            steps,
            snapshot,
        }
    }

    /// Operator-triggered repair: clears any standing alert and walks the
    /// ladder from the first rung
    pub async fn repair(&self) -> Result<RepairResult> {
        let snapshot = self.check(true).await;
        if snapshot.is_healthy() && snapshot.alert.is_none() {
            return Ok(RepairResult {
                success: true,
                steps: Vec::new(),
                snapshot,
            });
        }

        self.clear_alert();
        let result = self.run_ladder().await;
        if result.success {
            Ok(result)
        } else {
            let summary: Vec<String> = result
                .steps
                .iter()
                .map(|s| format!("{:?}: {}", s.action, s.message.as_deref().unwrap_or("ok")))
                .collect();
            Err(RoutingError::repair_exhausted(
                self.applier.driver().name(),
                format!("backend still unhealthy after repair ({})", summary.join("; ")),
            ))
        }
    }

    /// One monitoring pass: probe, and repair when unhealthy
    pub async fn tick(&self) -> Option<RepairResult> {
        let snapshot = self.check(true).await;

        let standing_since = self.state.lock().alert.as_ref().map(|(at, _)| *at);
        if let Some(since) = standing_since {
            if since.elapsed() >= self.cooldown {
                info!("Repair cooldown elapsed, ladder re-armed");
                self.clear_alert();
            } else {
                error!(alert = ?snapshot.alert, state = ?snapshot.state, "Standing health alert");
                return None;
            }
        }

        if snapshot.state != HealthState::Unhealthy || !self.auto_repair {
            return None;
        }
        Some(self.run_ladder().await)
    }

    /// Probe every interval until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(result) = self.tick().await {
                        info!(success = result.success, steps = result.steps.len(), "Repair finished");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
