//! Route model and naming convention
//!
//! A route is identified by `(type, agent_id, subdomain)`. Everything the proxy
//! engines see (router, service and backend names, match rules, FQDNs) is
//! derived from the key and the base domains, so it can always be recomputed
//! and parsed back when the registry is rebuilt from live configuration.

use crate::config::DomainConfig;
use crate::error::{Result, RoutingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subdomain sentinel for TCP routes (one MongoDB route per agent)
pub const TCP_SUBDOMAIN: &str = "mongodb";

const SERVICE_SUFFIX: &str = "-service";
const TCP_PREFIX: &str = "mongodb-";
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Http,
    Tcp,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Http => "http",
            RouteType::Tcp => "tcp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(RouteType::Http),
            "tcp" | "mongodb" => Some(RouteType::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a route in the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteKey {
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub agent_id: String,
    pub subdomain: String,
}

impl RouteKey {
    pub fn http(agent_id: &str, subdomain: &str) -> Self {
        Self {
            route_type: RouteType::Http,
            agent_id: agent_id.to_string(),
            subdomain: subdomain.to_string(),
        }
    }

    pub fn tcp(agent_id: &str) -> Self {
        Self {
            route_type: RouteType::Tcp,
            agent_id: agent_id.to_string(),
            subdomain: TCP_SUBDOMAIN.to_string(),
        }
    }

    /// Build a key from caller input, normalizing and validating each part.
    /// The subdomain is ignored for TCP routes.
    pub fn parse(route_type: RouteType, agent_id: &str, subdomain: &str) -> Result<Self> {
        let agent_id = validate_label("agent id", agent_id)?;
        match route_type {
            RouteType::Http => {
                let subdomain = validate_label("subdomain", subdomain)?;
                Ok(Self::http(&agent_id, &subdomain))
            }
            RouteType::Tcp => Ok(Self::tcp(&agent_id)),
        }
    }

    /// Router (HTTP/TCP) or switching-rule name
    pub fn router_name(&self) -> String {
        match self.route_type {
            RouteType::Http => format!("{}-{}", self.agent_id, self.subdomain),
            RouteType::Tcp => format!("{}{}", TCP_PREFIX, self.agent_id),
        }
    }

    /// Service (Traefik) or backend (HAProxy) name
    pub fn service_name(&self) -> String {
        format!("{}{}", self.router_name(), SERVICE_SUFFIX)
    }

    pub fn backend_ref(&self) -> BackendRef {
        BackendRef {
            router: self.router_name(),
            service: self.service_name(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.route_type, self.agent_id, self.subdomain)
    }
}

/// Driver-specific construct names realizing a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRef {
    pub router: String,
    pub service: String,
}

/// Match condition of a frontend rule, including its TLS intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCondition {
    /// HTTP Host header; `tls` routes only TLS-terminated requests
    Host { domain: String, tls: bool },
    /// TLS SNI server name; `passthrough` forwards encrypted bytes untouched
    HostSni { domain: String, passthrough: bool },
}

impl MatchCondition {
    pub fn domain(&self) -> &str {
        match self {
            MatchCondition::Host { domain, .. } | MatchCondition::HostSni { domain, .. } => domain,
        }
    }

    pub fn uses_tls(&self) -> bool {
        match self {
            MatchCondition::Host { tls, .. } => *tls,
            MatchCondition::HostSni { passthrough, .. } => *passthrough,
        }
    }

    /// Traefik rule syntax, e.g. ``Host(`blog.apps.example.com`)``.
    /// TLS is carried by the router, not the rule.
    pub fn rule(&self) -> String {
        match self {
            MatchCondition::Host { domain, .. } => format!("Host(`{}`)", domain),
            MatchCondition::HostSni { domain, .. } => format!("HostSNI(`{}`)", domain),
        }
    }

    pub fn parse_rule(rule: &str, tls: bool) -> Option<Self> {
        let rule = rule.trim();
        if let Some(inner) = rule.strip_prefix("HostSNI(`").and_then(|r| r.strip_suffix("`)")) {
            return Some(MatchCondition::HostSni {
                domain: inner.to_string(),
                passthrough: tls,
            });
        }
        if let Some(inner) = rule.strip_prefix("Host(`").and_then(|r| r.strip_suffix("`)")) {
            return Some(MatchCondition::Host {
                domain: inner.to_string(),
                tls,
            });
        }
        None
    }

    /// HAProxy anonymous ACLs for a `use_backend ... if` rule.
    ///
    /// Passthrough peeks the SNI from the client hello (`req_ssl_sni`); plain
    /// TCP reads it from the TLS session the frontend terminated (`ssl_fc_sni`).
    pub fn haproxy_condition(&self) -> String {
        match self {
            MatchCondition::Host { domain, tls: false } => format!("{{ req.hdr(host) -i {} }}", domain),
            MatchCondition::Host { domain, tls: true } => {
                format!("{{ req.hdr(host) -i {} }} {{ ssl_fc }}", domain)
            }
            MatchCondition::HostSni { domain, passthrough: true } => {
                format!("{{ req_ssl_sni -i {} }}", domain)
            }
            MatchCondition::HostSni { domain, passthrough: false } => {
                format!("{{ ssl_fc_sni -i {} }}", domain)
            }
        }
    }

    pub fn parse_haproxy_condition(cond: &str) -> Option<Self> {
        let cond = cond.trim();
        let (cond, tls) = match cond.strip_suffix("{ ssl_fc }") {
            Some(rest) => (rest.trim(), true),
            None => (cond, false),
        };
        let inner = cond.strip_prefix('{')?.strip_suffix('}')?.trim();
        if let Some(d) = inner.strip_prefix("req.hdr(host) -i ") {
            return Some(MatchCondition::Host {
                domain: d.trim().to_string(),
                tls,
            });
        }
        if tls {
            return None;
        }
        if let Some(d) = inner.strip_prefix("req_ssl_sni -i ") {
            return Some(MatchCondition::HostSni {
                domain: d.trim().to_string(),
                passthrough: true,
            });
        }
        if let Some(d) = inner.strip_prefix("ssl_fc_sni -i ") {
            return Some(MatchCondition::HostSni {
                domain: d.trim().to_string(),
                passthrough: false,
            });
        }
        None
    }
}

/// Base domains from which FQDNs are derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domains {
    pub app_domain: String,
    pub mongo_domain: String,
}

impl Domains {
    pub fn new(app_domain: &str, mongo_domain: &str) -> Self {
        Self {
            app_domain: app_domain.to_lowercase(),
            mongo_domain: mongo_domain.to_lowercase(),
        }
    }

    pub fn domain_for(&self, key: &RouteKey) -> String {
        match key.route_type {
            RouteType::Http => format!("{}.{}", key.subdomain, self.app_domain),
            RouteType::Tcp => format!("{}.{}", key.agent_id, self.mongo_domain),
        }
    }

    pub fn match_condition(&self, key: &RouteKey, use_tls: bool) -> MatchCondition {
        let domain = self.domain_for(key);
        match key.route_type {
            RouteType::Http => MatchCondition::Host { domain, tls: use_tls },
            RouteType::Tcp => MatchCondition::HostSni {
                domain,
                passthrough: use_tls,
            },
        }
    }

    /// Recover a route key from a live router name and its match condition.
    ///
    /// Returns `None` for constructs that do not follow the naming convention
    /// (hand-written routers, dashboards, ...).
    pub fn key_from_router(&self, router: &str, condition: &MatchCondition) -> Option<RouteKey> {
        let key = match condition {
            MatchCondition::Host { domain, .. } => {
                let subdomain = domain.strip_suffix(&format!(".{}", self.app_domain))?;
                let agent_id = router.strip_suffix(&format!("-{}", subdomain))?;
                if agent_id.is_empty() || subdomain.is_empty() || subdomain.contains('.') {
                    return None;
                }
                RouteKey::http(agent_id, subdomain)
            }
            MatchCondition::HostSni { domain, .. } => {
                let agent_id = router.strip_prefix(TCP_PREFIX)?;
                if agent_id.is_empty() {
                    return None;
                }
                let key = RouteKey::tcp(agent_id);
                if self.domain_for(&key) != *domain {
                    return None;
                }
                key
            }
        };
        Some(key)
    }

    /// Recover a route key from a live service/backend name and its match condition
    pub fn key_from_service(&self, service: &str, condition: &MatchCondition) -> Option<RouteKey> {
        let router = service.strip_suffix(SERVICE_SUFFIX)?;
        self.key_from_router(router, condition)
    }
}

impl From<&DomainConfig> for Domains {
    fn from(config: &DomainConfig) -> Self {
        Domains::new(&config.app_domain, &config.mongo_domain)
    }
}

/// A logical routing intent held by the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    #[serde(flatten)]
    pub key: RouteKey,
    pub domain: String,
    pub target: String,
    pub use_tls: bool,
    pub backend_ref: BackendRef,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Route {
    pub fn new(key: RouteKey, target: &str, use_tls: bool, domains: &Domains) -> Self {
        let now = Utc::now();
        Self {
            domain: domains.domain_for(&key),
            backend_ref: key.backend_ref(),
            key,
            target: target.to_string(),
            use_tls,
            created_at: now,
            last_updated: now,
        }
    }

    /// Whether a live construct realizes exactly this route
    pub fn matches_live(&self, live: &LiveRoute) -> bool {
        self.key == live.key && self.target == live.target && self.use_tls == live.use_tls
    }
}

/// A route reconstructed from live backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRoute {
    pub key: RouteKey,
    pub target: String,
    pub use_tls: bool,
}

/// What the backend should hold for a key after a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredState {
    Present { target: String, use_tls: bool },
    Absent,
}

impl DesiredState {
    pub fn is_satisfied_by(&self, live: Option<&LiveRoute>) -> bool {
        match (self, live) {
            (DesiredState::Absent, None) => true,
            (DesiredState::Present { target, use_tls }, Some(live)) => {
                live.target == *target && live.use_tls == *use_tls
            }
            _ => false,
        }
    }
}

/// Host/port split of a target as the engines need it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
    /// Backend speaks TLS itself (https URL)
    pub tls: bool,
}

impl TargetAddress {
    pub fn from_http_url(target: &str) -> Result<Self> {
        let url = reqwest::Url::parse(target)
            .map_err(|e| RoutingError::validation(format!("invalid target URL '{}': {}", target, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| RoutingError::validation(format!("target URL '{}' has no host", target)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RoutingError::validation(format!("target URL '{}' has no port", target)))?;
        Ok(Self {
            host: host.to_string(),
            port,
            tls: url.scheme() == "https",
        })
    }

    pub fn from_host_port(target: &str) -> Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| RoutingError::validation(format!("target '{}' must be host:port", target)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| RoutingError::validation(format!("invalid port in target '{}'", target)))?;
        if host.is_empty() || port == 0 {
            return Err(RoutingError::validation(format!("invalid target '{}'", target)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls: false,
        })
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL form for HTTP services
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Validate a DNS label (agent id, subdomain) and return it lower-cased
pub fn validate_label(field: &str, value: &str) -> Result<String> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return Err(RoutingError::validation(format!("{} is required", field)));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(RoutingError::validation(format!(
            "{} '{}' exceeds {} characters",
            field, value, MAX_LABEL_LEN
        )));
    }
    if !value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(RoutingError::validation(format!(
            "{} '{}' may only contain letters, digits and dashes",
            field, value
        )));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(RoutingError::validation(format!(
            "{} '{}' must not start or end with a dash",
            field, value
        )));
    }
    Ok(value)
}

/// Normalize an HTTP target; bare `host:port` gets `protocol://` prepended
pub fn normalize_http_target(target: &str, protocol: &str) -> Result<String> {
    let target = target.trim();
    if target.is_empty() {
        return Err(RoutingError::validation("target URL is required"));
    }
    let candidate = if target.contains("://") {
        target.to_string()
    } else {
        format!("{}://{}", protocol.to_lowercase(), target)
    };
    let url = reqwest::Url::parse(&candidate)
        .map_err(|e| RoutingError::validation(format!("invalid target URL '{}': {}", target, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(RoutingError::validation(format!(
            "unsupported target scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| RoutingError::validation(format!("target URL '{}' has no host", target)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RoutingError::validation(format!("target URL '{}' has no port", target)))?;
    let path = url.path().trim_end_matches('/');
    Ok(format!("{}://{}:{}{}", url.scheme(), host, port, path))
}

/// Normalize a TCP target into `host:port`
pub fn normalize_tcp_target(host: &str, port: u16) -> Result<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(RoutingError::validation("target host is required"));
    }
    if host.contains(char::is_whitespace) || host.contains('/') {
        return Err(RoutingError::validation(format!("invalid target host '{}'", host)));
    }
    if port == 0 {
        return Err(RoutingError::validation("target port must be greater than 0"));
    }
    Ok(format!("{}:{}", host, port))
}
