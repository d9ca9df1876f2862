//! Traefik dynamic configuration document
//!
//! Maps are `BTreeMap`s so the written YAML is stable between applies. Keys
//! this crate does not manage are kept through `extra` so hand-written
//! routers, services and middlewares survive a rewrite.

use crate::route::{Domains, LiveRoute, MatchCondition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Extra = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSection>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,
    #[serde(default)]
    pub services: BTreeMap<String, HttpService>,
    #[serde(default)]
    pub middlewares: BTreeMap<String, serde_yaml::Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,
    #[serde(default)]
    pub services: BTreeMap<String, TcpService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, serde_yaml::Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Router {
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "entryPoints", default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTls {
    #[serde(rename = "certResolver", default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<bool>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpService {
    #[serde(rename = "loadBalancer", default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<HttpLoadBalancer>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpLoadBalancer {
    #[serde(default)]
    pub servers: Vec<HttpServer>,
    #[serde(rename = "passHostHeader", default, skip_serializing_if = "Option::is_none")]
    pub pass_host_header: Option<bool>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServer {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpService {
    #[serde(rename = "loadBalancer", default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<TcpLoadBalancer>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpLoadBalancer {
    #[serde(default)]
    pub servers: Vec<TcpServer>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpServer {
    pub address: String,
}

impl DynamicConfig {
    /// Document with both sections present and empty
    pub fn bootstrap() -> Self {
        Self {
            http: Some(HttpSection::default()),
            tcp: Some(TcpSection::default()),
            extra: Extra::new(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn http_mut(&mut self) -> &mut HttpSection {
        self.http.get_or_insert_with(HttpSection::default)
    }

    pub fn tcp_mut(&mut self) -> &mut TcpSection {
        self.tcp.get_or_insert_with(TcpSection::default)
    }

    /// Create or replace an HTTP service with a single server
    pub fn upsert_http_service(&mut self, name: &str, url: &str) {
        let service = self.http_mut().services.entry(name.to_string()).or_default();
        let lb = service.load_balancer.get_or_insert_with(HttpLoadBalancer::default);
        lb.servers = vec![HttpServer { url: url.to_string() }];
        lb.pass_host_header.get_or_insert(true);
    }

    /// Create or replace a TCP service with a single server
    pub fn upsert_tcp_service(&mut self, name: &str, address: &str) {
        let service = self.tcp_mut().services.entry(name.to_string()).or_default();
        let lb = service.load_balancer.get_or_insert_with(TcpLoadBalancer::default);
        lb.servers = vec![TcpServer {
            address: address.to_string(),
        }];
    }

    pub fn upsert_http_router(&mut self, id: &str, router: Router) {
        self.http_mut().routers.insert(id.to_string(), router);
    }

    pub fn upsert_tcp_router(&mut self, id: &str, router: Router) {
        self.tcp_mut().routers.insert(id.to_string(), router);
    }

    /// Remove a service from both sections and every router pointing at it.
    /// Returns whether anything was removed.
    pub fn remove_service(&mut self, name: &str) -> bool {
        let mut removed = false;
        if let Some(http) = self.http.as_mut() {
            removed |= http.services.remove(name).is_some();
            let before = http.routers.len();
            http.routers.retain(|_, r| r.service != name);
            removed |= http.routers.len() != before;
        }
        if let Some(tcp) = self.tcp.as_mut() {
            removed |= tcp.services.remove(name).is_some();
            let before = tcp.routers.len();
            tcp.routers.retain(|_, r| r.service != name);
            removed |= tcp.routers.len() != before;
        }
        removed
    }

    pub fn router_count(&self) -> usize {
        self.http.as_ref().map_or(0, |h| h.routers.len()) + self.tcp.as_ref().map_or(0, |t| t.routers.len())
    }

    /// Structural problems; empty means valid
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match &self.http {
            None => problems.push("missing 'http' section".to_string()),
            Some(http) => {
                for (id, router) in &http.routers {
                    check_router("http", id, router, |s| http.services.contains_key(s), &mut problems);
                    for mw in &router.middlewares {
                        if !is_provider_ref(mw) && !http.middlewares.contains_key(mw) {
                            problems.push(format!("http router '{}' references missing middleware '{}'", id, mw));
                        }
                    }
                }
                for (name, service) in &http.services {
                    if let Some(lb) = &service.load_balancer {
                        if lb.servers.is_empty() {
                            problems.push(format!("http service '{}' has no servers", name));
                        }
                    }
                }
            }
        }

        match &self.tcp {
            None => problems.push("missing 'tcp' section".to_string()),
            Some(tcp) => {
                for (id, router) in &tcp.routers {
                    check_router("tcp", id, router, |s| tcp.services.contains_key(s), &mut problems);
                }
                for (name, service) in &tcp.services {
                    if let Some(lb) = &service.load_balancer {
                        if lb.servers.is_empty() {
                            problems.push(format!("tcp service '{}' has no servers", name));
                        }
                    }
                }
            }
        }

        problems
    }

    /// Routes realized by this document under the naming convention
    pub fn live_routes(&self, domains: &Domains) -> Vec<LiveRoute> {
        let mut routes = Vec::new();

        if let Some(http) = &self.http {
            for (id, router) in &http.routers {
                let Some(condition) = MatchCondition::parse_rule(&router.rule, router.tls.is_some()) else {
                    continue;
                };
                let Some(key) = domains.key_from_router(id, &condition) else {
                    continue;
                };
                let target = http
                    .services
                    .get(&router.service)
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.servers.first())
                    .map(|s| s.url.clone());
                if let Some(target) = target {
                    routes.push(LiveRoute {
                        key,
                        target,
                        use_tls: condition.uses_tls(),
                    });
                }
            }
        }

        if let Some(tcp) = &self.tcp {
            for (id, router) in &tcp.routers {
                let passthrough = router
                    .tls
                    .as_ref()
                    .and_then(|t| t.passthrough)
                    .unwrap_or(false);
                let Some(condition) = MatchCondition::parse_rule(&router.rule, passthrough) else {
                    continue;
                };
                let Some(key) = domains.key_from_router(id, &condition) else {
                    continue;
                };
                let target = tcp
                    .services
                    .get(&router.service)
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.servers.first())
                    .map(|s| s.address.clone());
                if let Some(target) = target {
                    routes.push(LiveRoute {
                        key,
                        target,
                        use_tls: passthrough,
                    });
                }
            }
        }

        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }
}

fn is_provider_ref(name: &str) -> bool {
    name.contains('@')
}

fn check_router(
    section: &str,
    id: &str,
    router: &Router,
    service_exists: impl Fn(&str) -> bool,
    problems: &mut Vec<String>,
) {
    if router.rule.trim().is_empty() {
        problems.push(format!("{} router '{}' has no rule", section, id));
    }
    if router.service.is_empty() {
        problems.push(format!("{} router '{}' has no service", section, id));
    } else if !is_provider_ref(&router.service) && !service_exists(&router.service) {
        problems.push(format!(
            "{} router '{}' references missing service '{}'",
            section, id, router.service
        ));
    }
}
