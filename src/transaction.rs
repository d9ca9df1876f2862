//! Data Plane API transactions
//!
//! Every staged change of the transactional driver runs inside a server-side
//! transaction tracked here. A record is locked for the duration of each call
//! made on its behalf; the cleanup sweep uses `try_lock` so it never aborts a
//! transaction while a stage or commit is in flight. A transaction claimed by
//! a writer (the driver's current transaction) is also skipped between calls,
//! until the writer releases it or it leaves the open state.

use crate::dataplane::{ApiError, Balance, BackendObject, DataPlaneClient, ServerObject, SwitchingRule};
use crate::driver::ValidationReport;
use crate::error::{Result, RoutingError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Open,
    Committed,
    Aborted,
    /// A commit was sent but its outcome was not observed
    Unknown,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

/// One Data Plane call recorded against a transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StagedOp {
    /// Create or replace a backend and its single server
    PutBackend {
        name: String,
        mode: String,
        server: ServerObject,
    },
    DeleteBackend {
        name: String,
    },
    /// Create or replace the `use_backend` rule pointing at `backend`
    PutSwitchingRule {
        frontend: String,
        backend: String,
        cond_test: String,
    },
    /// Drop every `use_backend` rule pointing at `backend`
    DeleteSwitchingRules {
        frontend: String,
        backend: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: TransactionStatus,
    pub ops: Vec<StagedOp>,
    pub validated: bool,
    /// Configuration version the transaction was started from
    pub version: i64,
    /// Held by a writer that has more calls to make; never swept
    pub claimed: bool,
}

impl Transaction {
    fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub aborted: Vec<String>,
    /// Open transactions skipped because a call was in flight or a writer
    /// still holds them
    pub busy: usize,
}

pub struct TransactionManager {
    client: Arc<DataPlaneClient>,
    backend: String,
    records: DashMap<String, Arc<Mutex<Transaction>>>,
}

impl TransactionManager {
    pub fn new(client: Arc<DataPlaneClient>, backend: &str) -> Self {
        Self {
            client,
            backend: backend.to_string(),
            records: DashMap::new(),
        }
    }

    fn api_error(&self, id: &str, e: ApiError) -> RoutingError {
        e.into_routing(&self.backend).with_transaction(id)
    }

    fn record(&self, id: &str) -> Result<Arc<Mutex<Transaction>>> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                RoutingError::backend(&self.backend, "unknown transaction").with_transaction(id)
            })
    }

    fn require_open(&self, tx: &Transaction) -> Result<()> {
        match tx.status {
            TransactionStatus::Open => Ok(()),
            TransactionStatus::Unknown => Err(RoutingError::ambiguous(
                &self.backend,
                "commit outcome unknown; refresh the transaction first",
            )
            .with_transaction(&tx.id)),
            status => Err(RoutingError::conflict(
                &self.backend,
                format!("transaction is {:?}, not open", status),
            )
            .with_transaction(&tx.id)),
        }
    }

    /// Start a transaction on the current configuration version
    pub async fn begin(&self) -> Result<String> {
        self.start(false).await
    }

    /// [`begin`](Self::begin) for a writer that keeps the transaction across
    /// several calls; the sweep leaves it alone until [`release`](Self::release)
    pub async fn begin_claimed(&self) -> Result<String> {
        self.start(true).await
    }

    async fn start(&self, claimed: bool) -> Result<String> {
        let version = self
            .client
            .version()
            .await
            .map_err(|e| e.into_routing(&self.backend))?;
        let info = self
            .client
            .start_transaction(version)
            .await
            .map_err(|e| e.into_routing(&self.backend))?;

        let tx = Transaction {
            id: info.id.clone(),
            created_at: Utc::now(),
            status: TransactionStatus::Open,
            ops: Vec::new(),
            validated: false,
            version: if info.version > 0 { info.version } else { version },
            claimed,
        };
        self.records.insert(info.id.clone(), Arc::new(Mutex::new(tx)));

        info!(transaction_id = %info.id, version, claimed, "Transaction started");
        Ok(info.id)
    }

    /// Execute one call inside the transaction and record it
    pub async fn stage(&self, id: &str, op: StagedOp) -> Result<()> {
        let record = self.record(id)?;
        let mut tx = record.lock().await;
        self.require_open(&tx)?;

        self.execute(id, &op).await.map_err(|e| self.api_error(id, e))?;
        debug!(transaction_id = id, op = ?op, "Staged");
        tx.ops.push(op);
        tx.validated = false;
        Ok(())
    }

    async fn execute(&self, tx: &str, op: &StagedOp) -> std::result::Result<(), ApiError> {
        match op {
            StagedOp::PutBackend { name, mode, server } => {
                let backend = BackendObject {
                    name: name.clone(),
                    mode: mode.clone(),
                    balance: Some(Balance {
                        algorithm: "roundrobin".to_string(),
                    }),
                };
                let exists = self.client.backends(Some(tx)).await?.iter().any(|b| b.name == *name);
                if exists {
                    self.client.replace_backend(tx, &backend).await?;
                } else {
                    self.client.create_backend(tx, &backend).await?;
                }

                let servers = self.client.servers(Some(tx), name).await?;
                if servers.iter().any(|s| s.name == server.name) {
                    self.client.replace_server(tx, name, server).await
                } else {
                    self.client.create_server(tx, name, server).await
                }
            }
            StagedOp::DeleteBackend { name } => {
                if !self.client.delete_backend(tx, name).await? {
                    debug!(transaction_id = tx, backend = %name, "Backend already absent");
                }
                Ok(())
            }
            StagedOp::PutSwitchingRule {
                frontend,
                backend,
                cond_test,
            } => {
                let rules = self.client.switching_rules(Some(tx), frontend).await?;
                let mut matching: Vec<&SwitchingRule> = rules.iter().filter(|r| r.name == *backend).collect();
                matching.sort_by_key(|r| r.index);

                let Some((first, duplicates)) = matching.split_first() else {
                    let rule = SwitchingRule {
                        index: rules.len() as u32,
                        name: backend.clone(),
                        cond: Some("if".to_string()),
                        cond_test: Some(cond_test.clone()),
                    };
                    return self.client.create_switching_rule(tx, frontend, &rule).await;
                };

                // Highest index first so the remaining indexes stay put
                for dup in duplicates.iter().rev() {
                    self.client.delete_switching_rule(tx, frontend, dup.index).await?;
                }
                if first.cond_test.as_deref() != Some(cond_test.as_str()) || first.cond.as_deref() != Some("if") {
                    let rule = SwitchingRule {
                        index: first.index,
                        name: backend.clone(),
                        cond: Some("if".to_string()),
                        cond_test: Some(cond_test.clone()),
                    };
                    self.client.replace_switching_rule(tx, frontend, &rule).await?;
                }
                Ok(())
            }
            StagedOp::DeleteSwitchingRules { frontend, backend } => {
                let mut indexes: Vec<u32> = self
                    .client
                    .switching_rules(Some(tx), frontend)
                    .await?
                    .into_iter()
                    .filter(|r| r.name == *backend)
                    .map(|r| r.index)
                    .collect();
                indexes.sort_unstable_by(|a, b| b.cmp(a));
                for index in indexes {
                    self.client.delete_switching_rule(tx, frontend, index).await?;
                }
                Ok(())
            }
        }
    }

    /// Check the configuration as it would look after commit
    pub async fn validate(&self, id: &str) -> Result<ValidationReport> {
        let record = self.record(id)?;
        let mut tx = record.lock().await;
        self.require_open(&tx)?;

        let raw = self
            .client
            .raw_configuration(Some(id))
            .await
            .map_err(|e| self.api_error(id, e))?;

        match self.client.validate_raw(&raw).await {
            Ok(()) => {
                tx.validated = true;
                Ok(ValidationReport::ok())
            }
            Err(ApiError::Status { status, message }) if matches!(status, 400 | 422) => {
                tx.validated = false;
                warn!(transaction_id = id, %message, "Transaction failed validation");
                Ok(ValidationReport::invalid(message))
            }
            Err(e) => Err(self.api_error(id, e)),
        }
    }

    /// Commit; refused without a prior successful validation unless `force`
    pub async fn commit(&self, id: &str, force: bool) -> Result<()> {
        let record = self.record(id)?;
        let mut tx = record.lock().await;
        self.require_open(&tx)?;

        if !force && !tx.validated {
            return Err(RoutingError::conflict(
                &self.backend,
                "transaction must be validated before commit",
            )
            .with_transaction(id));
        }

        match self.client.commit_transaction(id).await {
            Ok(()) => {
                tx.status = TransactionStatus::Committed;
                info!(transaction_id = id, ops = tx.ops.len(), "Transaction committed");
                Ok(())
            }
            Err(e) if e.is_indeterminate() => {
                tx.status = TransactionStatus::Unknown;
                error!(transaction_id = id, error = %e, "Commit outcome unknown");
                Err(RoutingError::ambiguous(&self.backend, format!("commit outcome unknown: {}", e))
                    .with_transaction(id))
            }
            Err(e) => Err(self.api_error(id, e)),
        }
    }

    /// Abort; a no-op for transactions already aborted
    pub async fn abort(&self, id: &str) -> Result<()> {
        if let Some(TransactionStatus::Unknown) = self.status(id).await {
            self.refresh(id).await?;
        }

        let record = self.record(id)?;
        let mut tx = record.lock().await;
        match tx.status {
            TransactionStatus::Aborted => return Ok(()),
            TransactionStatus::Committed => {
                return Err(RoutingError::conflict(&self.backend, "transaction already committed")
                    .with_transaction(id))
            }
            TransactionStatus::Open | TransactionStatus::Unknown => {}
        }

        self.client
            .delete_transaction(id)
            .await
            .map_err(|e| self.api_error(id, e))?;
        tx.status = TransactionStatus::Aborted;
        info!(transaction_id = id, "Transaction aborted");
        Ok(())
    }

    /// Re-query the server and resolve the local status
    pub async fn refresh(&self, id: &str) -> Result<TransactionStatus> {
        let record = self.record(id)?;
        let mut tx = record.lock().await;
        if tx.status.is_terminal() {
            return Ok(tx.status);
        }

        let remote = self
            .client
            .get_transaction(id)
            .await
            .map_err(|e| self.api_error(id, e))?;

        let status = match remote {
            Some(info) if info.status == "success" => TransactionStatus::Committed,
            // in_progress, or failed (the commit was rejected and the transaction can be aborted)
            Some(_) => TransactionStatus::Open,
            None => {
                // Committed transactions are dropped by the server too; the
                // configuration version tells both cases apart
                let current = self
                    .client
                    .version()
                    .await
                    .map_err(|e| self.api_error(id, e))?;
                if current > tx.version {
                    TransactionStatus::Committed
                } else {
                    TransactionStatus::Aborted
                }
            }
        };

        if status != tx.status {
            info!(transaction_id = id, from = ?tx.status, to = ?status, "Transaction status resolved");
        }
        tx.status = status;
        Ok(status)
    }

    /// Hand a claimed transaction back to the sweep
    pub async fn release(&self, id: &str) {
        if let Some(record) = self.records.get(id).map(|r| r.value().clone()) {
            record.lock().await.claimed = false;
        }
    }

    pub async fn status(&self, id: &str) -> Option<TransactionStatus> {
        let record = self.records.get(id).map(|r| r.value().clone())?;
        let tx = record.lock().await;
        Some(tx.status)
    }

    pub async fn get(&self, id: &str) -> Option<Transaction> {
        let record = self.records.get(id).map(|r| r.value().clone())?;
        let tx = record.lock().await;
        Some(tx.clone())
    }

    /// All tracked transactions, oldest first
    pub async fn list(&self) -> Vec<Transaction> {
        let records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(record.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Abort open transactions older than `max_age`, or every open one when `all`.
    ///
    /// With `all`, server-side `in_progress` transactions unknown to this
    /// manager are aborted as well. Terminal records older than `max_age` are
    /// forgotten.
    pub async fn cleanup(&self, max_age: Duration, all: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();

        for record in records {
            // A held lock means a call is in flight for this transaction
            let Ok(mut tx) = record.try_lock() else {
                report.busy += 1;
                continue;
            };
            if tx.status != TransactionStatus::Open {
                if tx.status.is_terminal() && tx.age() >= max_age {
                    self.records.remove(&tx.id);
                }
                continue;
            }
            if tx.claimed {
                debug!(transaction_id = %tx.id, "Transaction held by a writer, not sweeping");
                report.busy += 1;
                continue;
            }
            if !all && tx.age() < max_age {
                continue;
            }

            match self.client.delete_transaction(&tx.id).await {
                Ok(_) => {
                    tx.status = TransactionStatus::Aborted;
                    warn!(
                        transaction_id = %tx.id,
                        age_secs = tx.age().as_secs(),
                        "Aborted stale transaction"
                    );
                    report.aborted.push(tx.id.clone());
                }
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "Failed to abort stale transaction");
                }
            }
        }

        if all {
            let remote = self
                .client
                .list_transactions()
                .await
                .map_err(|e| e.into_routing(&self.backend))?;
            for info in remote {
                if info.status != "in_progress" || self.records.contains_key(&info.id) {
                    continue;
                }
                match self.client.delete_transaction(&info.id).await {
                    Ok(_) => {
                        warn!(transaction_id = %info.id, "Aborted untracked transaction");
                        report.aborted.push(info.id);
                    }
                    Err(e) => {
                        warn!(transaction_id = %info.id, error = %e, "Failed to abort untracked transaction")
                    }
                }
            }
        }

        Ok(report)
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until shutdown
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        max_age: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.cleanup(max_age, false).await {
                            Ok(report) if !report.aborted.is_empty() => {
                                info!(aborted = report.aborted.len(), "Transaction sweep finished");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Transaction sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Transaction sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn insert_record(&self, tx: Transaction) {
        self.records.insert(tx.id.clone(), Arc::new(Mutex::new(tx)));
    }
}
