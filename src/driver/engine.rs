//! Proxy engine process handling shared by both drivers
//!
//! Liveness comes from the PID file (signal 0) and/or a health URL; reloads
//! send SIGHUP; restarts run an operator-supplied command.

use crate::config::EngineConfig;
use crate::error::{Result, RoutingError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct EngineProcess {
    name: String,
    pid_file: Option<PathBuf>,
    restart_command: Option<Vec<String>>,
    health_url: Option<String>,
    reload_signal: bool,
    restart_timeout: Duration,
    client: reqwest::Client,
}

impl EngineProcess {
    pub fn from_config(name: &str, config: &EngineConfig, probe_timeout: Duration) -> anyhow::Result<Self> {
        let restart_command = match &config.restart_command {
            Some(command) => {
                let words = shell_words::split(command)?;
                if words.is_empty() {
                    anyhow::bail!("restart command is empty");
                }
                Some(words)
            }
            None => None,
        };

        let client = reqwest::Client::builder().timeout(probe_timeout).build()?;

        Ok(Self {
            name: name.to_string(),
            pid_file: config.pid_file.as_ref().map(PathBuf::from),
            restart_command,
            health_url: config.health_url.clone(),
            reload_signal: config.reload_signal,
            restart_timeout: config.restart_timeout(),
            client,
        })
    }

    /// Engine without process management; liveness is unknown
    pub fn unmanaged(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid_file: None,
            restart_command: None,
            health_url: None,
            reload_signal: false,
            restart_timeout: Duration::from_secs(60),
            client: reqwest::Client::new(),
        }
    }

    pub fn can_restart(&self) -> bool {
        self.restart_command.is_some()
    }

    fn read_pid(&self) -> Option<i32> {
        let path = self.pid_file.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let pid = parse_pid(&content);
        if pid.is_none() {
            warn!(engine = %self.name, path = %path.display(), content = content.trim(), "Ignoring invalid PID file");
        }
        pid
    }

    /// `None` when nothing is configured to tell
    pub async fn is_running(&self) -> Option<bool> {
        let mut verdict = None;

        if self.pid_file.is_some() {
            let alive = self.read_pid().map(pid_alive).unwrap_or(false);
            debug!(engine = %self.name, alive, "PID liveness check");
            verdict = Some(alive);
        }

        if let Some(url) = &self.health_url {
            let ok = match self.client.get(url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    debug!(engine = %self.name, url, error = %e, "Engine health URL unreachable");
                    false
                }
            };
            verdict = Some(verdict.unwrap_or(true) && ok);
        }

        verdict
    }

    /// Ask the engine to re-read its configuration (SIGHUP), when enabled
    pub fn reload(&self) {
        if !self.reload_signal {
            return;
        }
        let Some(pid) = self.read_pid() else {
            warn!(engine = %self.name, "Reload requested but no PID is available");
            return;
        };
        info!(engine = %self.name, pid, "Sending SIGHUP to engine");
        send_hangup(pid);
    }

    /// Run the restart command and wait for it within the restart timeout
    pub async fn restart(&self) -> Result<()> {
        let Some(words) = &self.restart_command else {
            return Err(RoutingError::backend(&self.name, "no restart command configured"));
        };

        info!(engine = %self.name, command = ?words, "Restarting engine");
        let mut command = Command::new(&words[0]);
        command
            .args(&words[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RoutingError::backend(&self.name, format!("failed to spawn restart command: {}", e)))?;

        let output = tokio::time::timeout(self.restart_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RoutingError::ambiguous(
                    &self.name,
                    format!("restart command exceeded {}s", self.restart_timeout.as_secs()),
                )
            })?
            .map_err(|e| RoutingError::backend(&self.name, format!("restart command failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RoutingError::backend(
                &self.name,
                format!("restart command exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        info!(engine = %self.name, "Engine restarted");
        Ok(())
    }
}

/// A single positive process id; 0 and negative values address process
/// groups in `kill(2)` and are rejected, as is init
fn parse_pid(content: &str) -> Option<i32> {
    let pid: u32 = content.trim().parse().ok()?;
    if pid <= 1 {
        return None;
    }
    i32::try_from(pid).ok()
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    // Signal 0 only checks that the process exists and we may signal it
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    true
}

#[cfg(unix)]
fn send_hangup(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGHUP);
    }
}

#[cfg(not(unix))]
fn send_hangup(_pid: i32) {}
