//! Traefik dynamic configuration file driver
//!
//! Staged calls edit an in-memory copy of the live document. `apply` backs up
//! the current file, replaces it atomically (temp file in the same directory,
//! then rename) and optionally sends SIGHUP to the engine. Traefik's file
//! provider normally picks up the rename on its own.

use super::document::{DynamicConfig, Router, RouterTls};
use super::engine::EngineProcess;
use super::{BackendDriver, BackendSpec, DriverHealth, ValidationReport};
use crate::config::FileDriverConfig;
use crate::error::{Result, RoutingError};
use crate::route::{Domains, LiveRoute, MatchCondition, RouteType};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Where the live file and its backups live
#[derive(Debug, Clone)]
struct FileLayout {
    live: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    /// Backup file prefix, the live file's stem
    stem: String,
}

impl FileLayout {
    fn backup_name(&self, seq: u64) -> PathBuf {
        let ts = Utc::now().format("%Y%m%dT%H%M%S%3f");
        self.backup_dir.join(format!("{}-{}-{:06}.yml", self.stem, ts, seq))
    }

    /// Backups oldest first
    fn backups(&self) -> std::io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let prefix = format!("{}-", self.stem);
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".yml"))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Copy the live file into the backup directory and prune old copies
    fn backup(&self, target: &Path) -> std::io::Result<()> {
        if !self.live.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.backup_dir)?;
        std::fs::copy(&self.live, target)?;

        let backups = self.backups()?;
        if backups.len() > self.max_backups {
            for old in &backups[..backups.len() - self.max_backups] {
                if let Err(e) = std::fs::remove_file(old) {
                    warn!(path = %old.display(), error = %e, "Failed to prune backup");
                }
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub struct DeclarativeFileDriver {
    name: String,
    layout: FileLayout,
    http_entrypoint: String,
    tcp_entrypoint: String,
    cert_resolver: Option<String>,
    domains: Domains,
    engine: EngineProcess,
    /// Pending document; `None` when nothing is staged
    staged: Mutex<Option<DynamicConfig>>,
    backup_seq: AtomicU64,
}

impl DeclarativeFileDriver {
    pub fn new(config: &FileDriverConfig, domains: Domains, engine: EngineProcess) -> Self {
        let live = config.live_path();
        let stem = live
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dynamic")
            .to_string();

        Self {
            name: "file".to_string(),
            layout: FileLayout {
                live,
                backup_dir: config.backup_path(),
                max_backups: config.max_backups.max(1),
                stem,
            },
            http_entrypoint: config.http_entrypoint.clone(),
            tcp_entrypoint: config.tcp_entrypoint.clone(),
            cert_resolver: config.cert_resolver.clone(),
            domains,
            engine,
            staged: Mutex::new(None),
            backup_seq: AtomicU64::new(0),
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.layout.live
    }

    /// Backups currently on disk, oldest first
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        self.layout.backups().map_err(|e| self.io_error("list backups", e))
    }

    fn io_error(&self, action: &str, e: impl std::fmt::Display) -> RoutingError {
        RoutingError::backend(&self.name, format!("failed to {}: {}", action, e))
    }

    async fn blocking<F>(&self, action: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> std::io::Result<()> + Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(action, e)),
            Err(e) => Err(self.io_error(action, e)),
        }
    }

    /// Read the live document, creating it with empty sections when missing
    async fn read_live(&self) -> Result<DynamicConfig> {
        match tokio::fs::read_to_string(&self.layout.live).await {
            Ok(content) => DynamicConfig::parse(&content).map_err(|e| {
                RoutingError::backend(
                    &self.name,
                    format!("{} is not valid YAML: {}", self.layout.live.display(), e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let doc = DynamicConfig::bootstrap();
                let content = doc
                    .to_yaml()
                    .map_err(|e| self.io_error("serialize configuration", e))?;
                let path = self.layout.live.clone();
                self.blocking("create configuration file", move || write_atomic(&path, &content))
                    .await?;
                info!(path = %self.layout.live.display(), "Created dynamic configuration file");
                Ok(doc)
            }
            Err(e) => Err(self.io_error("read configuration file", e)),
        }
    }

    /// Run `edit` against the staged document, seeding it from the live file
    async fn edit_staged<F>(&self, mut edit: F) -> Result<()>
    where
        F: FnMut(&mut DynamicConfig) + Send,
    {
        loop {
            {
                let mut staged = self.staged.lock();
                if let Some(doc) = staged.as_mut() {
                    edit(doc);
                    return Ok(());
                }
            }

            let mut live = self.read_live().await?;
            live.http_mut();
            live.tcp_mut();

            let mut staged = self.staged.lock();
            if staged.is_none() {
                *staged = Some(live);
            }
        }
    }

    async fn write_live(&self, doc: &DynamicConfig) -> Result<()> {
        let content = doc
            .to_yaml()
            .map_err(|e| self.io_error("serialize configuration", e))?;
        let layout = self.layout.clone();
        let backup = layout.backup_name(self.backup_seq.fetch_add(1, Ordering::SeqCst));

        self.blocking("write configuration file", move || {
            layout.backup(&backup)?;
            write_atomic(&layout.live, &content)
        })
        .await
    }

    fn router_for(&self, frontend_id: &str, backend_name: &str, condition: &MatchCondition) -> Router {
        let tls = match condition {
            MatchCondition::Host { tls: false, .. } => None,
            MatchCondition::Host { tls: true, .. } => Some(RouterTls {
                cert_resolver: self.cert_resolver.clone(),
                ..RouterTls::default()
            }),
            MatchCondition::HostSni { passthrough: true, .. } => Some(RouterTls {
                passthrough: Some(true),
                ..RouterTls::default()
            }),
            MatchCondition::HostSni { passthrough: false, .. } => Some(RouterTls {
                cert_resolver: self.cert_resolver.clone(),
                ..RouterTls::default()
            }),
        };
        Router {
            rule: condition.rule(),
            service: backend_name.to_string(),
            entry_points: vec![frontend_id.to_string()],
            tls,
            ..Router::default()
        }
    }
}

#[async_trait]
impl BackendDriver for DeclarativeFileDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn frontend_id(&self, route_type: RouteType) -> &str {
        match route_type {
            RouteType::Http => &self.http_entrypoint,
            RouteType::Tcp => &self.tcp_entrypoint,
        }
    }

    async fn stage_add_backend(&self, name: &str, spec: &BackendSpec) -> Result<()> {
        debug!(service = name, target = %spec.target, "Staging service");
        self.edit_staged(|doc| match spec.protocol {
            RouteType::Http => doc.upsert_http_service(name, &spec.target),
            RouteType::Tcp => doc.upsert_tcp_service(name, &spec.target),
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
        let router = self.router_for(frontend_id, backend_name, condition);
        debug!(router = rule_id, rule = %router.rule, "Staging router");
        self.edit_staged(|doc| match condition {
            MatchCondition::Host { .. } => doc.upsert_http_router(rule_id, router.clone()),
            MatchCondition::HostSni { .. } => doc.upsert_tcp_router(rule_id, router.clone()),
        })
        .await
    }

    async fn stage_remove_backend(&self, name: &str) -> Result<()> {
        self.edit_staged(|doc| {
            if !doc.remove_service(name) {
                debug!(service = name, "Service not present, nothing to remove");
            }
        })
        .await
    }

    async fn validate(&self) -> Result<ValidationReport> {
        let staged = self.staged.lock().clone();
        let doc = match staged {
            Some(doc) => doc,
            None => self.read_live().await?,
        };

        let problems = doc.validate();
        if problems.is_empty() {
            Ok(ValidationReport::ok())
        } else {
            Ok(ValidationReport::invalid(problems.join("; ")))
        }
    }

    async fn apply(&self) -> Result<()> {
        let staged = self.staged.lock().clone();
        let Some(doc) = staged else {
            return Ok(());
        };

        self.write_live(&doc).await?;

        // Only clear what was written; a concurrent stage would have replaced it
        {
            let mut staged = self.staged.lock();
            if staged.as_ref() == Some(&doc) {
                *staged = None;
            }
        }

        info!(path = %self.layout.live.display(), routers = doc.router_count(), "Dynamic configuration applied");
        self.engine.reload();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.staged.lock().take().is_some() {
            debug!("Discarded staged configuration");
            return Ok(());
        }

        let backups = self.backups()?;
        let Some(latest) = backups.last().cloned() else {
            return Err(RoutingError::backend(&self.name, "no backup available to restore"));
        };

        let content = tokio::fs::read_to_string(&latest)
            .await
            .map_err(|e| self.io_error("read backup", e))?;
        DynamicConfig::parse(&content).map_err(|e| {
            RoutingError::backend(&self.name, format!("backup {} is corrupt: {}", latest.display(), e))
        })?;

        let live = self.layout.live.clone();
        let consumed = latest.clone();
        self.blocking("restore backup", move || {
            write_atomic(&live, &content)?;
            std::fs::remove_file(&consumed)
        })
        .await?;

        warn!(backup = %latest.display(), "Restored dynamic configuration from backup");
        self.engine.reload();
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.staged.lock().is_some()
    }

    async fn check_health(&self) -> DriverHealth {
        // An unmanaged engine cannot be observed; the file is all we know
        let process_running = self.engine.is_running().await.unwrap_or(true);

        let (config_valid, error) = match tokio::fs::read_to_string(&self.layout.live).await {
            Ok(content) => match DynamicConfig::parse(&content) {
                Ok(doc) => {
                    let problems = doc.validate();
                    (problems.is_empty(), (!problems.is_empty()).then(|| problems.join("; ")))
                }
                Err(e) => (false, Some(format!("invalid YAML: {}", e))),
            },
            Err(e) => (false, Some(format!("cannot read {}: {}", self.layout.live.display(), e))),
        };

        let last_error = match error {
            Some(e) => Some(e),
            None if !process_running => Some("engine process is not running".to_string()),
            None => None,
        };

        DriverHealth {
            process_running,
            config_valid,
            last_error,
        }
    }

    async fn load_routes(&self) -> Result<Vec<LiveRoute>> {
        let doc = self.read_live().await?;
        Ok(doc.live_routes(&self.domains))
    }

    async fn restart(&self) -> Result<()> {
        self.engine.restart().await
    }
}
