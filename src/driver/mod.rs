//! Backend drivers
//!
//! A driver translates route mutations into proxy-engine objects. Changes are
//! first *staged*, then validated and applied as one unit:
//!
//! ```text
//! stage_add_backend ─┐
//! stage_frontend_rule├─▶ validate ─▶ apply ──(ok)──▶ live
//! stage_remove_backend┘      │          │
//!                            └──(err)───┴──▶ rollback (discard staged)
//! ```
//!
//! Two engines are implemented:
//! - [`transactional::TransactionalDriver`]: HAProxy Data Plane API, every
//!   staged call runs inside a server-side transaction
//! - [`file::DeclarativeFileDriver`]: Traefik dynamic configuration file,
//!   staged calls edit an in-memory document that replaces the file on apply
//!
//! Staging is idempotent: adding the same backend twice leaves one construct;
//! removing a missing one is a no-op.

pub mod document;
pub mod engine;
pub mod file;
pub mod transactional;

use crate::error::Result;
use crate::route::{LiveRoute, MatchCondition, RouteType};
use async_trait::async_trait;
use serde::Serialize;

pub use file::DeclarativeFileDriver;
pub use transactional::TransactionalDriver;

/// What a backend/service must forward to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub protocol: RouteType,
    /// URL for HTTP, `host:port` for TCP
    pub target: String,
    /// HTTP: TLS-terminated router; TCP: passthrough
    pub use_tls: bool,
}

/// Outcome of a driver-side validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}

/// Raw health facts reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverHealth {
    pub process_running: bool,
    pub config_valid: bool,
    pub last_error: Option<String>,
}

impl DriverHealth {
    pub fn is_healthy(&self) -> bool {
        self.process_running && self.config_valid
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Identifier used in logs and error context
    fn name(&self) -> &str;

    /// Frontend (HAProxy) or entry point (Traefik) that carries routes of a type
    fn frontend_id(&self, route_type: RouteType) -> &str;

    /// Create or replace a backend/service
    async fn stage_add_backend(&self, name: &str, spec: &BackendSpec) -> Result<()>;

    /// Create or replace the rule sending `condition` to `backend_name`
    async fn stage_frontend_rule(
        &self,
        frontend_id: &str,
        backend_name: &str,
        condition: &MatchCondition,
        rule_id: &str,
    ) -> Result<()>;

    /// Remove a backend/service and every rule pointing at it
    async fn stage_remove_backend(&self, name: &str) -> Result<()>;

    /// Check the staged configuration without applying it
    async fn validate(&self) -> Result<ValidationReport>;

    /// Make staged changes live
    async fn apply(&self) -> Result<()>;

    /// Discard pending staged changes; with nothing pending, revert the last
    /// applied change
    async fn rollback(&self) -> Result<()>;

    /// Whether staged, unapplied changes exist
    fn has_pending(&self) -> bool;

    /// Probe process liveness and live configuration validity
    async fn check_health(&self) -> DriverHealth;

    /// Routes realized by the live configuration
    async fn load_routes(&self) -> Result<Vec<LiveRoute>>;

    /// Restart the engine process
    async fn restart(&self) -> Result<()>;
}
