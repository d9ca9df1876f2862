//! Routing service over the Traefik dynamic configuration file driver

mod common;

use common::{domains, fast_retry, health_config};
use routekeeper::applier::ConfigApplier;
use routekeeper::config::FileDriverConfig;
use routekeeper::driver::engine::EngineProcess;
use routekeeper::driver::DeclarativeFileDriver;
use routekeeper::error::ErrorKind;
use routekeeper::health::{HealthMonitor, HealthState, RepairAction};
use routekeeper::registry::RouteRegistry;
use routekeeper::route::RouteType;
use routekeeper::service::{HttpRouteOptions, RoutingService, TcpRouteOptions};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    live: PathBuf,
    driver: Arc<DeclarativeFileDriver>,
    service: RoutingService,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("dynamic").join("routes.yml");
    let config = FileDriverConfig {
        path: live.to_string_lossy().into_owned(),
        backup_dir: Some(dir.path().join("backups").to_string_lossy().into_owned()),
        max_backups: 3,
        ..FileDriverConfig::default()
    };
    let driver = Arc::new(DeclarativeFileDriver::new(
        &config,
        domains(),
        EngineProcess::unmanaged("traefik"),
    ));
    let registry = Arc::new(RouteRegistry::new());
    let timeout = Duration::from_secs(2);
    let applier = Arc::new(ConfigApplier::new(driver.clone(), registry, domains(), fast_retry(), timeout));
    let health = Arc::new(HealthMonitor::new(applier.clone(), None, &health_config(1), timeout));

    Harness {
        _dir: dir,
        live,
        driver,
        service: RoutingService::new(applier, health),
    }
}

fn read_yaml(path: &Path) -> Value {
    serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_http_route_written_as_router_and_service() {
    let h = harness();
    assert_eq!(h.service.initialize().await.unwrap(), 0);

    let route = h
        .service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap();
    assert_eq!(route.domain, "blog.apps.cloudlunacy.uk");

    let doc = read_yaml(&h.live);
    let router = &doc["http"]["routers"]["agent-1-blog"];
    assert_eq!(router["rule"].as_str(), Some("Host(`blog.apps.cloudlunacy.uk`)"));
    assert_eq!(router["service"].as_str(), Some("agent-1-blog-service"));
    assert_eq!(router["entryPoints"][0].as_str(), Some("websecure"));
    assert_eq!(router["tls"]["certResolver"].as_str(), Some("letsencrypt"));

    let service = &doc["http"]["services"]["agent-1-blog-service"];
    assert_eq!(
        service["loadBalancer"]["servers"][0]["url"].as_str(),
        Some("http://10.0.0.5:8080")
    );
}

#[tokio::test]
async fn test_tcp_route_written_with_passthrough() {
    let h = harness();

    h.service
        .add_tcp_route("agent-1", "10.0.0.9", 27017, TcpRouteOptions::default())
        .await
        .unwrap();

    let doc = read_yaml(&h.live);
    let router = &doc["tcp"]["routers"]["mongodb-agent-1"];
    assert_eq!(router["rule"].as_str(), Some("HostSNI(`agent-1.mongodb.cloudlunacy.uk`)"));
    assert_eq!(router["service"].as_str(), Some("mongodb-agent-1-service"));
    assert_eq!(router["entryPoints"][0].as_str(), Some("mongodb"));
    assert_eq!(router["tls"]["passthrough"].as_bool(), Some(true));
    assert_eq!(
        doc["tcp"]["services"]["mongodb-agent-1-service"]["loadBalancer"]["servers"][0]["address"].as_str(),
        Some("10.0.0.9:27017")
    );
}

#[tokio::test]
async fn test_target_paths_are_kept() {
    let h = harness();

    let route = h
        .service
        .add_http_route("agent-1", "blog", "http://10.0.0.5:8080/app/", HttpRouteOptions::default())
        .await
        .unwrap();
    assert_eq!(route.target, "http://10.0.0.5:8080/app");

    let report = h.service.reconcile().await.unwrap();
    assert!(report.restaged.is_empty());
}

#[tokio::test]
async fn test_hand_written_constructs_survive_rewrites() {
    let h = harness();
    write_file(
        &h.live,
        r#"
http:
  routers:
    dashboard:
      rule: Host(`traefik.apps.cloudlunacy.uk`)
      service: api@internal
      middlewares:
        - auth
    agent-2-shop:
      rule: Host(`shop.apps.cloudlunacy.uk`)
      service: agent-2-shop-service
      entryPoints:
        - websecure
      tls:
        certResolver: letsencrypt
  services:
    agent-2-shop-service:
      loadBalancer:
        servers:
          - url: http://10.0.0.7:8080
  middlewares:
    auth:
      basicAuth:
        users:
          - admin:$apr1$placeholder
tcp:
  routers: {}
  services: {}
"#,
    );

    assert_eq!(h.service.initialize().await.unwrap(), 1);
    let shop = &h.service.get_agent_routes("agent-2").unwrap()[0];
    assert_eq!(shop.target, "http://10.0.0.7:8080");
    assert!(shop.use_tls);

    h.service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap();
    h.service.remove_route("agent-2", "shop", RouteType::Http).await.unwrap();

    let doc = read_yaml(&h.live);
    assert_eq!(doc["http"]["routers"]["dashboard"]["service"].as_str(), Some("api@internal"));
    assert!(doc["http"]["middlewares"]["auth"]["basicAuth"].is_mapping());
    assert!(doc["http"]["routers"]["agent-2-shop"].is_null());
    assert!(doc["http"]["services"]["agent-2-shop-service"].is_null());
    assert!(doc["http"]["routers"]["agent-1-blog"].is_mapping());
}

#[tokio::test]
async fn test_remove_route() {
    let h = harness();
    h.service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap();

    assert!(h.service.remove_route("agent-1", "blog", RouteType::Http).await.unwrap());
    assert!(!h.service.remove_route("agent-1", "blog", RouteType::Http).await.unwrap());

    let doc = read_yaml(&h.live);
    assert!(doc["http"]["routers"]["agent-1-blog"].is_null());
    assert!(h.service.get_all_routes().unwrap().is_empty());
}

#[tokio::test]
async fn test_applies_keep_bounded_backups() {
    let h = harness();
    h.service.initialize().await.unwrap();

    for i in 0..5 {
        h.service
            .add_http_route("agent-1", "blog", &format!("10.0.0.{}:8080", i + 1), HttpRouteOptions::default())
            .await
            .unwrap();
    }

    let backups = h.driver.backups().unwrap();
    assert_eq!(backups.len(), 3);
    let latest: Value = serde_yaml::from_str(&std::fs::read_to_string(backups.last().unwrap()).unwrap()).unwrap();
    assert_eq!(
        latest["http"]["services"]["agent-1-blog-service"]["loadBalancer"]["servers"][0]["url"].as_str(),
        Some("http://10.0.0.4:8080")
    );
}

#[tokio::test]
async fn test_repair_restages_routes_into_broken_file() {
    let h = harness();
    h.service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap();
    assert!(h.service.check_health(true).await.unwrap().is_healthy());

    // A router left pointing at a service that was deleted by hand
    write_file(
        &h.live,
        r#"
http:
  routers:
    agent-1-blog:
      rule: Host(`blog.apps.cloudlunacy.uk`)
      service: agent-1-blog-service
      tls: {}
  services: {}
tcp:
  routers: {}
  services: {}
"#,
    );
    let snapshot = h.service.check_health(true).await.unwrap();
    assert_eq!(snapshot.state, HealthState::Unhealthy);
    assert!(!snapshot.config_valid);

    let result = h.service.repair().await.unwrap();
    assert!(result.success);
    assert!(result
        .steps
        .iter()
        .any(|s| s.action == RepairAction::Reconcile && s.success));
    assert!(result.steps.iter().all(|s| s.action != RepairAction::Restart));

    let doc = read_yaml(&h.live);
    assert_eq!(
        doc["http"]["services"]["agent-1-blog-service"]["loadBalancer"]["servers"][0]["url"].as_str(),
        Some("http://10.0.0.5:8080")
    );
}

#[tokio::test]
async fn test_repair_restores_backup_of_unparseable_file() {
    let h = harness();
    h.service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap();
    h.service
        .add_http_route("agent-1", "shop", "10.0.0.6:8080", HttpRouteOptions::default())
        .await
        .unwrap();
    assert!(h.service.check_health(true).await.unwrap().is_healthy());
    assert_eq!(h.driver.backups().unwrap().len(), 2);

    write_file(&h.live, "http: [not, a, mapping\n");

    let result = h.service.repair().await.unwrap();
    assert!(result.success);
    assert!(result
        .steps
        .iter()
        .any(|s| s.action == RepairAction::Rollback && s.success));
    assert!(result.steps.iter().all(|s| s.action != RepairAction::Restart));
    assert!(h.service.health_monitor().unwrap().alert().is_none());

    // Restored copy predates the second route; reconcile puts it back
    let doc = read_yaml(&h.live);
    assert_eq!(
        doc["http"]["services"]["agent-1-blog-service"]["loadBalancer"]["servers"][0]["url"].as_str(),
        Some("http://10.0.0.5:8080")
    );
    assert_eq!(
        doc["http"]["services"]["agent-1-shop-service"]["loadBalancer"]["servers"][0]["url"].as_str(),
        Some("http://10.0.0.6:8080")
    );
    assert_eq!(h.service.get_all_routes().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unrepairable_file_raises_alert() {
    let h = harness();
    h.service.initialize().await.unwrap();
    assert!(h.service.check_health(true).await.unwrap().is_healthy());

    write_file(&h.live, "http: [not, a, mapping\n");

    let err = h.service.repair().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RepairExhausted);

    let monitor = h.service.health_monitor().unwrap();
    assert!(monitor.alert().is_some());
    assert!(h.service.check_health(true).await.unwrap().alert.is_some());

    h.service.clear_alert().unwrap();
    assert!(monitor.alert().is_none());
}

#[tokio::test]
async fn test_cleanup_is_noop_without_transactions() {
    let h = harness();
    let report = h
        .service
        .cleanup_transactions(Duration::from_secs(600), true)
        .await
        .unwrap();
    assert!(report.aborted.is_empty());
    assert_eq!(h.service.stats().await.unwrap().driver, "file");
}

#[tokio::test]
async fn test_service_without_driver() {
    let service = RoutingService::unavailable(Arc::new(RouteRegistry::new()));

    let err = service
        .add_http_route("agent-1", "blog", "10.0.0.5:8080", HttpRouteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DriverUnavailable);
    assert_eq!(
        service.remove_route("agent-1", "blog", RouteType::Http).await.unwrap_err().kind(),
        ErrorKind::DriverUnavailable
    );
    assert_eq!(service.get_all_routes().unwrap_err().kind(), ErrorKind::DriverUnavailable);
    assert_eq!(service.check_health(false).await.unwrap_err().kind(), ErrorKind::DriverUnavailable);
    assert_eq!(service.repair().await.unwrap_err().kind(), ErrorKind::DriverUnavailable);
    assert!(service.driver().is_none());
    assert!(service.health_monitor().is_none());
}
