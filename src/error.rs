//! Error taxonomy for route reconciliation
//!
//! Every failure surfaced by the control plane is a [`RoutingError`] tagged with
//! an [`ErrorKind`]. The kind decides what the caller may do next: transient
//! errors are retried inside the applier, ambiguous ones require a re-read of
//! backend state, everything else propagates with enough context (route key,
//! backend, transaction id) to diagnose.

use serde::Serialize;
use std::fmt;

/// Classification of routing failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input (missing target, invalid agent id, ...)
    Validation,
    /// Timeout or connection refused talking to the backend
    TransientBackend,
    /// The backend rejected the staged configuration
    ConfigConflict,
    /// A commit/apply timed out; backend state must be re-read
    AmbiguousState,
    /// The repair ladder ran out of rungs
    RepairExhausted,
    /// No backend driver is wired into the service
    DriverUnavailable,
    /// Unexpected, non-retryable backend failure
    Backend,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::TransientBackend => "TRANSIENT_BACKEND",
            ErrorKind::ConfigConflict => "CONFIG_CONFLICT",
            ErrorKind::AmbiguousState => "AMBIGUOUS_STATE",
            ErrorKind::RepairExhausted => "REPAIR_EXHAUSTED",
            ErrorKind::DriverUnavailable => "DRIVER_UNAVAILABLE",
            ErrorKind::Backend => "BACKEND",
        }
    }

    /// Whether the applier may retry an operation that failed with this kind
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::TransientBackend)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// A classified routing failure with diagnostic context
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}{}", context_suffix(.route, .backend, .transaction_id, .attempts))]
pub struct RoutingError {
    kind: ErrorKind,
    message: String,
    route: Option<String>,
    backend: Option<String>,
    transaction_id: Option<String>,
    attempts: Option<u32>,
}

impl RoutingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            route: None,
            backend: None,
            transaction_id: None,
            attempts: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(backend: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientBackend, message).with_backend(backend)
    }

    pub fn conflict(backend: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigConflict, message).with_backend(backend)
    }

    pub fn ambiguous(backend: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AmbiguousState, message).with_backend(backend)
    }

    pub fn repair_exhausted(backend: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RepairExhausted, message).with_backend(backend)
    }

    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend, message).with_backend(backend)
    }

    pub fn driver_unavailable() -> Self {
        Self::new(ErrorKind::DriverUnavailable, "no backend driver is configured")
    }

    pub fn with_route(mut self, route: impl fmt::Display) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    pub fn with_transaction(mut self, id: &str) -> Self {
        self.transaction_id = Some(id.to_string());
        self
    }

    /// Number of attempts made before giving up
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Serializable view for the API layer
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.kind,
            message: self.message.clone(),
            route: self.route.clone(),
            backend: self.backend.clone(),
            transaction_id: self.transaction_id.clone(),
            attempts: self.attempts,
        }
    }
}

fn context_suffix(
    route: &Option<String>,
    backend: &Option<String>,
    transaction_id: &Option<String>,
    attempts: &Option<u32>,
) -> String {
    let mut parts = Vec::new();
    if let Some(route) = route {
        parts.push(format!("route={}", route));
    }
    if let Some(backend) = backend {
        parts.push(format!("backend={}", backend));
    }
    if let Some(id) = transaction_id {
        parts.push(format!("transaction={}", id));
    }
    if let Some(attempts) = attempts {
        parts.push(format!("attempts={}", attempts));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// JSON error body handed to the API layer
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ErrorReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}"}}"#,
                self.code.as_code(),
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

pub type Result<T, E = RoutingError> = std::result::Result<T, E>;
