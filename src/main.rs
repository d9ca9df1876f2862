use routekeeper::applier::ConfigApplier;
use routekeeper::config::{Config, DriverKind};
use routekeeper::dataplane::DataPlaneClient;
use routekeeper::driver::engine::EngineProcess;
use routekeeper::driver::{BackendDriver, DeclarativeFileDriver, TransactionalDriver};
use routekeeper::health::HealthMonitor;
use routekeeper::probe::ReachabilityProbe;
use routekeeper::registry::RouteRegistry;
use routekeeper::retry::RetryPolicy;
use routekeeper::route::Domains;
use routekeeper::service::RoutingService;
use routekeeper::transaction::TransactionManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routekeeper=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routekeeper.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let domains = Domains::from(&config.domains);
    let registry = Arc::new(RouteRegistry::new());
    let call_timeout = config.driver.timeout();

    let service = match config.driver.kind {
        DriverKind::None => {
            warn!("No driver configured; routing operations will fail with DRIVER_UNAVAILABLE");
            RoutingService::unavailable(registry)
        }
        kind => {
            let (driver, transactions): (Arc<dyn BackendDriver>, Option<Arc<TransactionManager>>) = match kind {
                DriverKind::Dataplane => {
                    let engine = EngineProcess::from_config("haproxy", &config.engine, call_timeout)?;
                    let dp = &config.driver.dataplane;
                    let client = Arc::new(DataPlaneClient::new(dp, call_timeout)?);
                    let transactions = Arc::new(TransactionManager::new(client.clone(), "dataplane"));
                    let driver = TransactionalDriver::new(
                        client,
                        transactions.clone(),
                        &dp.http_frontend,
                        &dp.tcp_frontend,
                        domains.clone(),
                        engine,
                    );
                    (Arc::new(driver), Some(transactions))
                }
                _ => {
                    let engine = EngineProcess::from_config("traefik", &config.engine, call_timeout)?;
                    let driver = DeclarativeFileDriver::new(&config.driver.file, domains.clone(), engine);
                    (Arc::new(driver), None)
                }
            };

            let applier = Arc::new(ConfigApplier::new(
                driver,
                registry,
                domains,
                RetryPolicy::from(&config.retry),
                call_timeout,
            ));

            let probe = if config.health.probes.is_empty() {
                None
            } else {
                Some(ReachabilityProbe::new(config.health.probes.clone(), call_timeout)?)
            };
            let health = Arc::new(HealthMonitor::new(applier.clone(), probe, &config.health, call_timeout));

            let mut service = RoutingService::new(applier, health.clone());
            if let Some(transactions) = transactions {
                handles.push(transactions.clone().spawn_cleanup_task(
                    config.transactions.cleanup_interval(),
                    config.transactions.max_age(),
                    shutdown_rx.clone(),
                ));
                service = service.with_transactions(transactions);
            }

            // A failed initial load leaves an empty registry; the monitor keeps probing
            match service.initialize().await {
                Ok(count) => info!(routes = count, "Registry loaded from live configuration"),
                Err(e) => error!(error = %e, "Failed to load routes from live configuration"),
            }

            handles.push(health.spawn(shutdown_rx.clone()));
            service
        }
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP reconciles
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reconciling live configuration...");
                    match service.reconcile().await {
                        Ok(report) => info!(
                            checked = report.checked,
                            restaged = report.restaged.len(),
                            "Reconcile finished"
                        ),
                        Err(e) => error!(error = %e, "Reconcile failed"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route control plane");
    info!(
        app_domain = %config.domains.app_domain,
        mongo_domain = %config.domains.mongo_domain,
        "Route domains"
    );
    match config.driver.kind {
        DriverKind::Dataplane => info!(
            url = %config.driver.dataplane.url,
            http_frontend = %config.driver.dataplane.http_frontend,
            tcp_frontend = %config.driver.dataplane.tcp_frontend,
            timeout_secs = config.driver.timeout_secs,
            "HAProxy Data Plane driver"
        ),
        DriverKind::File => info!(
            path = %config.driver.file.path,
            backup_dir = %config.driver.file.backup_path().display(),
            max_backups = config.driver.file.max_backups,
            timeout_secs = config.driver.timeout_secs,
            "Traefik file driver"
        ),
        DriverKind::None => info!("Driver disabled"),
    }
    info!(
        max_attempts = config.retry.max_attempts,
        base_delay_ms = config.retry.base_delay_ms,
        max_delay_ms = config.retry.max_delay_ms,
        "Retry settings"
    );
    info!(
        interval_secs = config.health.interval_secs,
        cache_ttl_secs = config.health.cache_ttl_secs,
        unhealthy_threshold = config.health.unhealthy_threshold,
        repair_cooldown_secs = config.health.repair_cooldown_secs,
        auto_repair = config.health.auto_repair,
        probes = config.health.probes.len(),
        "Health settings"
    );
}
