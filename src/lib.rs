//! Routekeeper - route reconciliation for a multi-tenant reverse proxy
//!
//! This library keeps the public routes of tenant agents in sync with the
//! proxy engine in front of them:
//! - HTTP routes (`<subdomain>.<app domain>`) and MongoDB SNI routes
//!   (`<agent>.<mongo domain>`) live in an in-memory registry
//! - Every change is staged, validated and applied through a backend driver
//!   (HAProxy Data Plane API or a Traefik dynamic configuration file)
//! - Transient failures are retried; ambiguous applies are resolved by
//!   re-reading the live configuration
//! - A health monitor probes the engine and walks a repair ladder
//!   (rollback, restart, alert) when it stays unhealthy

pub mod applier;
pub mod config;
pub mod dataplane;
pub mod driver;
pub mod error;
pub mod health;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod route;
pub mod service;
pub mod transaction;
