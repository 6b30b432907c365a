//! Health Checks
//!
//! Liveness answers whether the process should keep running. Readiness
//! combines the startup flag with a remote tier ping: with the remote store
//! unreachable the engine still serves from the local tier, so that case is
//! `Degraded`, which the readiness endpoint still answers with 200.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::cache::CacheManager;

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but from the local tier only
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Whether the endpoint should answer 200
    pub fn is_operational(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }
}

/// Outcome of one named check
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckOutcome {
    fn new(name: &'static str, status: HealthStatus, detail: Option<String>) -> Self {
        Self { name, status, detail }
    }
}

/// Readiness report: the worst check decides the overall status
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub status: HealthStatus,
    pub checks: Vec<CheckOutcome>,
    pub uptime_seconds: u64,
}

/// Process health flags
pub struct HealthCheck {
    started: Instant,
    live: AtomicBool,
    /// Set once connect and startup warmup have finished
    ready: AtomicBool,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn liveness_check(&self) -> CheckOutcome {
        if self.live.load(Ordering::Relaxed) {
            CheckOutcome::new("liveness", HealthStatus::Healthy, None)
        } else {
            CheckOutcome::new("liveness", HealthStatus::Unhealthy, Some("shutting down".into()))
        }
    }

    pub async fn readiness_check(&self, cache: &CacheManager) -> Readiness {
        let startup = if self.ready.load(Ordering::Relaxed) {
            CheckOutcome::new("startup", HealthStatus::Healthy, None)
        } else {
            CheckOutcome::new("startup", HealthStatus::Unhealthy, Some("starting".into()))
        };
        let remote = match cache.ping_remote().await {
            Ok(()) => CheckOutcome::new("remote-tier", HealthStatus::Healthy, None),
            Err(e) => CheckOutcome::new("remote-tier", HealthStatus::Degraded, Some(e.to_string())),
        };

        let checks = vec![startup, remote];
        Readiness {
            status: checks
                .iter()
                .map(|check| check.status)
                .max()
                .unwrap_or(HealthStatus::Healthy),
            checks,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryRemoteStore, ManualClock};
    use crate::config::CacheConfig;
    use std::sync::Arc;

    fn cache() -> (CacheManager, Arc<InMemoryRemoteStore>) {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
        let cache = CacheManager::with_remote(CacheConfig::default(), store.clone(), Arc::new(clock)).unwrap();
        (cache, store)
    }

    #[test]
    fn test_liveness() {
        let health = HealthCheck::new();
        assert_eq!(health.liveness_check().status, HealthStatus::Healthy);
        health.set_live(false);
        let outcome = health.liveness_check();
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(!outcome.status.is_operational());
    }

    #[tokio::test]
    async fn test_readiness_follows_startup_and_remote() {
        let health = HealthCheck::new();
        let (cache, store) = cache();

        assert_eq!(health.readiness_check(&cache).await.status, HealthStatus::Unhealthy);

        health.set_ready(true);
        assert_eq!(health.readiness_check(&cache).await.status, HealthStatus::Healthy);

        store.set_available(false);
        let readiness = health.readiness_check(&cache).await;
        assert_eq!(readiness.status, HealthStatus::Degraded);
        assert!(readiness.status.is_operational());
    }

    #[tokio::test]
    async fn test_readiness_json_shape() {
        let health = HealthCheck::new();
        health.set_ready(true);
        let (cache, store) = cache();
        store.set_available(false);

        let json = serde_json::to_value(health.readiness_check(&cache).await).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"][0]["name"], "startup");
        assert!(json["checks"][0].get("detail").is_none());
        assert!(json["checks"][1]["detail"].is_string());
    }
}
