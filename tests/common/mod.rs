//! Shared harness for integration tests

#![allow(dead_code)]

pub mod dataplane;
pub mod memory;

use routekeeper::config::HealthConfig;
use routekeeper::retry::RetryPolicy;
use routekeeper::route::Domains;
use std::time::Duration;

pub fn domains() -> Domains {
    Domains::new("apps.cloudlunacy.uk", "mongodb.cloudlunacy.uk")
}

/// Three attempts with short backoff so retry tests stay fast
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
    }
}

pub fn health_config(unhealthy_threshold: u32) -> HealthConfig {
    HealthConfig {
        interval_secs: 30,
        cache_ttl_secs: 5,
        unhealthy_threshold,
        repair_cooldown_secs: 300,
        auto_repair: true,
        probes: Vec::new(),
    }
}
