//! In-memory route registry
//!
//! The registry is the canonical "what should exist" table. It is constructed
//! once, shared behind an `Arc`, and only mutated by the config applier after a
//! change has been durably applied to the backend.

use crate::route::{Route, RouteKey, RouteType};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Route counts by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub http: usize,
    pub tcp: usize,
}

#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<RouteKey, Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RouteKey) -> Option<Route> {
        self.routes.read().get(key).cloned()
    }

    /// All routes of one agent, sorted by key
    pub fn get_by_agent(&self, agent_id: &str) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .routes
            .read()
            .values()
            .filter(|r| r.key.agent_id == agent_id)
            .cloned()
            .collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    /// All routes, sorted by key
    pub fn get_all(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    pub fn exists(&self, key: &RouteKey) -> bool {
        self.routes.read().contains_key(key)
    }

    /// Insert a route or update the existing entry for its key in place.
    ///
    /// An update keeps the original `created_at` and returns the stored route.
    pub fn upsert(&self, mut route: Route) -> Route {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.get(&route.key) {
            route.created_at = existing.created_at;
            debug!(route = %route.key, "Updating route in registry");
        } else {
            debug!(route = %route.key, "Adding route to registry");
        }
        routes.insert(route.key.clone(), route.clone());
        route
    }

    pub fn remove(&self, key: &RouteKey) -> Option<Route> {
        let removed = self.routes.write().remove(key);
        if removed.is_some() {
            debug!(route = %key, "Removed route from registry");
        }
        removed
    }

    /// Replace the whole table (load and resync)
    pub fn replace_all(&self, routes: Vec<Route>) {
        let table: HashMap<RouteKey, Route> =
            routes.into_iter().map(|r| (r.key.clone(), r)).collect();
        *self.routes.write() = table;
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let routes = self.routes.read();
        let http = routes
            .keys()
            .filter(|k| k.route_type == RouteType::Http)
            .count();
        RegistryStats {
            total: routes.len(),
            http,
            tcp: routes.len() - http,
        }
    }
}
