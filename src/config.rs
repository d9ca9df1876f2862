use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Base domains used to derive route FQDNs
    #[serde(default)]
    pub domains: DomainConfig,

    /// Which proxy engine to drive and how to reach it
    #[serde(default)]
    pub driver: DriverConfig,

    /// Proxy engine process management (liveness, reload, restart)
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry envelope for configuration changes
    #[serde(default)]
    pub retry: RetryConfig,

    /// Health probing and repair ladder
    #[serde(default)]
    pub health: HealthConfig,

    /// Transaction cleanup sweep (Data Plane driver only)
    #[serde(default)]
    pub transactions: TransactionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DomainConfig {
    /// Base domain for HTTP routes (`<subdomain>.<app_domain>`)
    #[serde(default = "default_app_domain")]
    pub app_domain: String,

    /// Base domain for MongoDB routes (`<agent_id>.<mongo_domain>`)
    #[serde(default = "default_mongo_domain")]
    pub mongo_domain: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            app_domain: default_app_domain(),
            mongo_domain: default_mongo_domain(),
        }
    }
}

/// Proxy engine flavor
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// HAProxy Data Plane API (transactional)
    #[serde(alias = "haproxy")]
    Dataplane,
    /// Traefik dynamic configuration file (declarative)
    #[default]
    #[serde(alias = "traefik")]
    File,
    /// No driver; every routing call fails with DRIVER_UNAVAILABLE
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriverConfig {
    /// Engine flavor (default: file)
    #[serde(default)]
    pub kind: DriverKind,

    /// Upper bound for every single driver call in seconds (default: 5)
    #[serde(default = "default_driver_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub dataplane: DataPlaneConfig,

    #[serde(default)]
    pub file: FileDriverConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::default(),
            timeout_secs: default_driver_timeout(),
            dataplane: DataPlaneConfig::default(),
            file: FileDriverConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataPlaneConfig {
    /// Base URL of the Data Plane API
    #[serde(default = "default_dataplane_url")]
    pub url: String,

    /// Basic auth user
    #[serde(default = "default_dataplane_user")]
    pub username: String,

    /// Basic auth password
    pub password: Option<String>,

    /// Frontend receiving HTTP(S) traffic
    #[serde(default = "default_http_frontend")]
    pub http_frontend: String,

    /// Frontend receiving MongoDB TLS traffic (SNI routing)
    #[serde(default = "default_tcp_frontend")]
    pub tcp_frontend: String,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_dataplane_url(),
            username: default_dataplane_user(),
            password: None,
            http_frontend: default_http_frontend(),
            tcp_frontend: default_tcp_frontend(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileDriverConfig {
    /// Live dynamic configuration file watched by the engine
    #[serde(default = "default_file_path")]
    pub path: String,

    /// Directory for backups (default: `backups/` next to the live file)
    pub backup_dir: Option<String>,

    /// Number of backups kept after each apply (default: 10)
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Entry point for HTTP routers
    #[serde(default = "default_http_entrypoint")]
    pub http_entrypoint: String,

    /// Entry point for MongoDB routers
    #[serde(default = "default_tcp_entrypoint")]
    pub tcp_entrypoint: String,

    /// Certificate resolver referenced by TLS-terminated HTTP routers
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: Option<String>,
}

impl Default for FileDriverConfig {
    fn default() -> Self {
        Self {
            path: default_file_path(),
            backup_dir: None,
            max_backups: default_max_backups(),
            http_entrypoint: default_http_entrypoint(),
            tcp_entrypoint: default_tcp_entrypoint(),
            cert_resolver: default_cert_resolver(),
        }
    }
}

impl FileDriverConfig {
    pub fn live_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    pub fn backup_path(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => PathBuf::from(dir),
            None => self
                .live_path()
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// PID file of the engine process; enables liveness checks and reload signals
    pub pid_file: Option<String>,

    /// Command used to restart the engine (e.g. "docker restart traefik")
    pub restart_command: Option<String>,

    /// URL answering 2xx while the engine is alive (e.g. Traefik /ping)
    pub health_url: Option<String>,

    /// Send SIGHUP to the engine after writing a new file (default: false)
    #[serde(default)]
    pub reload_signal: bool,

    /// Upper bound for the restart command in seconds (default: 60)
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            restart_command: None,
            health_url: None,
            reload_signal: false,
            restart_timeout_secs: default_restart_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per mutation, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds (default: 500)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Cap for the doubled delay in milliseconds (default: 5000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Add up to 10% random jitter to each delay (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: false,
        }
    }
}

/// Synthetic reachability check through the proxy
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeTarget {
    /// Any HTTP response proves the route is reachable
    Http { url: String },
    /// A completed TCP handshake proves the route is reachable
    Tcp { address: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Interval between probe ticks in seconds (default: 30)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// How long a snapshot is served from cache in seconds (default: 5)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Consecutive failed probes before the backend is unhealthy (default: 3)
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Window in which each repair rung is tried at most once (default: 300)
    #[serde(default = "default_repair_cooldown")]
    pub repair_cooldown_secs: u64,

    /// Run the repair ladder automatically when unhealthy (default: true)
    #[serde(default = "default_true")]
    pub auto_repair: bool,

    /// Optional reachability probes
    #[serde(default)]
    pub probes: Vec<ProbeTarget>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            cache_ttl_secs: default_cache_ttl(),
            unhealthy_threshold: default_unhealthy_threshold(),
            repair_cooldown_secs: default_repair_cooldown(),
            auto_repair: true,
            probes: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn repair_cooldown(&self) -> Duration {
        Duration::from_secs(self.repair_cooldown_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Interval between cleanup sweeps in seconds (default: 60)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Open transactions older than this are aborted in seconds (default: 600)
    #[serde(default = "default_transaction_max_age")]
    pub max_age_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            max_age_secs: default_transaction_max_age(),
        }
    }
}

impl TransactionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

// Default value functions
fn default_app_domain() -> String {
    "apps.cloudlunacy.uk".to_string()
}

fn default_mongo_domain() -> String {
    "mongodb.cloudlunacy.uk".to_string()
}

fn default_driver_timeout() -> u64 {
    5
}

fn default_dataplane_url() -> String {
    "http://127.0.0.1:5555".to_string()
}

fn default_dataplane_user() -> String {
    "admin".to_string()
}

fn default_http_frontend() -> String {
    "https_front".to_string()
}

fn default_tcp_frontend() -> String {
    "mongodb_front".to_string()
}

fn default_file_path() -> String {
    "/etc/traefik/dynamic/routes.yml".to_string()
}

fn default_max_backups() -> usize {
    10
}

fn default_http_entrypoint() -> String {
    "websecure".to_string()
}

fn default_tcp_entrypoint() -> String {
    "mongodb".to_string()
}

fn default_cert_resolver() -> Option<String> {
    Some("letsencrypt".to_string())
}

fn default_restart_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    5000
}

fn default_health_interval() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_repair_cooldown() -> u64 {
    300 // 5 minutes
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_transaction_max_age() -> u64 {
    600 // 10 minutes
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (field, domain) in [
            ("domains.app_domain", &self.domains.app_domain),
            ("domains.mongo_domain", &self.domains.mongo_domain),
        ] {
            if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
                errors.push(format!("'{}' must be a bare domain like 'apps.example.com'", field));
            }
        }

        if self.driver.timeout_secs == 0 {
            errors.push("'driver.timeout_secs' must be greater than 0".to_string());
        }

        match self.driver.kind {
            DriverKind::Dataplane => {
                if reqwest::Url::parse(&self.driver.dataplane.url).is_err() {
                    errors.push(format!(
                        "'driver.dataplane.url' is not a valid URL: {}",
                        self.driver.dataplane.url
                    ));
                }
                if self.driver.dataplane.http_frontend.is_empty()
                    || self.driver.dataplane.tcp_frontend.is_empty()
                {
                    errors.push("Data Plane frontends must not be empty".to_string());
                }
            }
            DriverKind::File => {
                if self.driver.file.path.is_empty() {
                    errors.push("'driver.file.path' must not be empty".to_string());
                }
                if self.driver.file.max_backups == 0 {
                    errors.push("'driver.file.max_backups' must be greater than 0".to_string());
                }
            }
            DriverKind::None => {}
        }

        if let Some(command) = &self.engine.restart_command {
            match shell_words::split(command) {
                Ok(words) if !words.is_empty() => {}
                _ => errors.push(format!("'engine.restart_command' cannot be parsed: {}", command)),
            }
        }

        if self.retry.max_attempts == 0 {
            errors.push("'retry.max_attempts' must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("'retry.base_delay_ms' must not exceed 'retry.max_delay_ms'".to_string());
        }

        if self.health.interval_secs == 0 {
            errors.push("'health.interval_secs' must be greater than 0".to_string());
        }
        if self.health.unhealthy_threshold == 0 {
            errors.push("'health.unhealthy_threshold' must be at least 1".to_string());
        }

        if self.transactions.cleanup_interval_secs == 0 {
            errors.push("'transactions.cleanup_interval_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
