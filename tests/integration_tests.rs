//! tiercache Integration Tests
//!
//! End-to-end behaviour of the engine through its public API:
//! - Expiry, tag invalidation, eviction and remote outages
//! - Promotion and stats accounting
//! - Warmup ordering and failure isolation
//! - Monitoring export

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tiercache::cache::{CacheManager, CacheOptions, InMemoryRemoteStore, ManualClock};
use tiercache::config::CacheConfig;
use tiercache::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
}

struct Engine {
    cache: CacheManager,
    store: Arc<InMemoryRemoteStore>,
    clock: ManualClock,
}

fn engine(config: CacheConfig) -> Engine {
    let clock = ManualClock::new();
    let store = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
    let cache = CacheManager::with_remote(config, store.clone(), Arc::new(clock.clone())).unwrap();
    Engine { cache, store, clock }
}

// =============================================================================
// Core Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let e = engine(CacheConfig::default());
        let ana = User { name: "Ana".into() };

        e.cache
            .set("user:42", &ana, CacheOptions::new().ttl(5).tag("users"))
            .await
            .unwrap();
        assert_eq!(e.cache.get::<User>("user:42", None).await.unwrap(), Some(ana));

        e.clock.advance(Duration::from_secs(6));
        assert_eq!(e.cache.get::<User>("user:42", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tag_invalidation_removes_all_members() {
        let e = engine(CacheConfig::default());

        e.cache.set("a", &1, CacheOptions::new().tag("g")).await.unwrap();
        e.cache.set("b", &2, CacheOptions::new().tag("g")).await.unwrap();

        assert_eq!(e.cache.invalidate_by_tags(["g"]).await.unwrap(), 2);
        assert_eq!(e.cache.get::<i32>("a", None).await.unwrap(), None);
        assert_eq!(e.cache.get::<i32>("b", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_capacity_evicts_oldest() {
        let mut config = CacheConfig::default();
        config.local.max_entries = 1;
        let e = engine(config);
        // Keep the remote tier out of the picture so reads only see the local tier
        e.store.set_available(false);

        e.cache.set("x", &1, CacheOptions::new()).await.unwrap();
        e.cache.set("y", &2, CacheOptions::new()).await.unwrap();

        assert_eq!(e.cache.get::<i32>("x", None).await.unwrap(), None);
        assert_eq!(e.cache.get::<i32>("y", None).await.unwrap(), Some(2));

        let stats = e.cache.stats().await;
        assert_eq!(stats.local.evictions, 1);
        assert_eq!(stats.local.key_count, 1);
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_local() {
        let e = engine(CacheConfig::default());
        e.cache.set("k", &"v", CacheOptions::new()).await.unwrap();

        e.store.set_available(false);
        assert_eq!(e.cache.get::<String>("k", None).await.unwrap().as_deref(), Some("v"));
        assert_eq!(e.cache.get::<String>("absent", None).await.unwrap(), None);

        // Writes keep succeeding against the local tier
        e.cache.set("k2", &"v2", CacheOptions::new()).await.unwrap();
        assert_eq!(e.cache.get::<String>("k2", None).await.unwrap().as_deref(), Some("v2"));
    }
}

// =============================================================================
// Tier Coordination
// =============================================================================

mod tiers {
    use super::*;

    #[tokio::test]
    async fn test_remote_hit_promotes_for_other_instances() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
        let writer = CacheManager::with_remote(CacheConfig::default(), store.clone(), Arc::new(clock.clone())).unwrap();
        let reader = CacheManager::with_remote(CacheConfig::default(), store, Arc::new(clock.clone())).unwrap();

        writer.set("shared", &7u32, CacheOptions::new().ttl(60)).await.unwrap();

        assert_eq!(reader.get::<u32>("shared", None).await.unwrap(), Some(7));
        assert_eq!(reader.get::<u32>("shared", None).await.unwrap(), Some(7));

        let stats = reader.stats().await;
        assert_eq!(stats.remote.hits, 1);
        assert_eq!(stats.local.hits, 1);
        assert_eq!(stats.promotions, 1);
    }

    #[tokio::test]
    async fn test_invalidation_reaches_other_instances() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
        let a = CacheManager::with_remote(CacheConfig::default(), store.clone(), Arc::new(clock.clone())).unwrap();
        let b = CacheManager::with_remote(CacheConfig::default(), store, Arc::new(clock.clone())).unwrap();

        a.set("p:1", &1, CacheOptions::new().tag("products")).await.unwrap();
        a.set("p:2", &2, CacheOptions::new().tag("products")).await.unwrap();

        assert_eq!(b.invalidate_by_tags(["products"]).await.unwrap(), 2);
        // Instance `a` still holds local copies; remote entries are gone
        assert!(!b.has("p:1", None).await.unwrap());
        assert!(!b.has("p:2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_invalidation_during_outage_clears_local_members() {
        let e = engine(CacheConfig::default());
        e.cache.set("a", &1, CacheOptions::new().tag("g")).await.unwrap();
        e.cache.set("b", &2, CacheOptions::new().tags(["g", "h"])).await.unwrap();

        e.store.set_available(false);
        assert_eq!(e.cache.invalidate_by_tags(["g"]).await.unwrap(), 2);
        assert_eq!(e.cache.get::<i32>("a", None).await.unwrap(), None);
        assert_eq!(e.cache.get::<i32>("b", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_write() {
        let e = engine(CacheConfig::default());

        // Encryption is not configured
        let result = e.cache.set("k", &1, CacheOptions::new().encrypt(true)).await;
        assert_matches!(result, Err(Error::InvalidOptions(_)));
        assert_matches!(e.cache.invalidate_by_tags([""]).await, Err(Error::InvalidOptions(_)));
        assert!(!e.cache.has("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_isolate_keys() {
        let e = engine(CacheConfig::default());
        e.cache
            .set("id", &"tenant-a", CacheOptions::new().namespace("a"))
            .await
            .unwrap();
        e.cache
            .set("id", &"tenant-b", CacheOptions::new().namespace("b"))
            .await
            .unwrap();

        assert_eq!(e.cache.get::<String>("id", Some("a")).await.unwrap().as_deref(), Some("tenant-a"));
        assert_eq!(e.cache.get::<String>("id", Some("b")).await.unwrap().as_deref(), Some("tenant-b"));
        assert_eq!(e.cache.get::<String>("id", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pattern_clear() {
        let e = engine(CacheConfig::default());
        e.cache.set("user:1", &1, CacheOptions::new()).await.unwrap();
        e.cache.set("user:2", &2, CacheOptions::new()).await.unwrap();
        e.cache.set("order:1", &3, CacheOptions::new()).await.unwrap();

        assert_eq!(e.cache.clear(Some("user:*")).await.unwrap(), 2);
        assert!(!e.cache.has("user:1", None).await.unwrap());
        assert!(e.cache.has("order:1", None).await.unwrap());

        assert_matches!(e.cache.clear(None).await, Err(Error::InvalidOptions(_)));
    }
}

// =============================================================================
// Stats
// =============================================================================

mod stats {
    use super::*;

    #[tokio::test]
    async fn test_every_get_is_one_hit_or_miss() {
        let e = engine(CacheConfig::default());
        e.cache.set("a", &1, CacheOptions::new()).await.unwrap();

        for key in ["a", "a", "missing", "a", "missing"] {
            let _: Option<i32> = e.cache.get(key, None).await.unwrap();
        }

        let stats = e.cache.stats().await;
        assert_eq!(stats.aggregate.hits, 3);
        assert_eq!(stats.aggregate.misses, 2);
        assert!((stats.hit_rate() - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reset_keeps_occupancy() {
        let e = engine(CacheConfig::default());
        e.cache.set("a", &1, CacheOptions::new()).await.unwrap();
        let _: Option<i32> = e.cache.get("a", None).await.unwrap();

        e.cache.reset_metrics();
        let stats = e.cache.stats().await;
        assert_eq!(stats.aggregate.hits, 0);
        assert_eq!(stats.local.key_count, 1);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let e = engine(CacheConfig::default());
        e.cache.set("k", &json!({"v": 1}), CacheOptions::new()).await.unwrap();
        e.cache.set("k", &json!({"v": 1}), CacheOptions::new()).await.unwrap();

        let stats = e.cache.stats().await;
        assert_eq!(stats.local.key_count, 1);
        assert_eq!(
            e.cache.get::<serde_json::Value>("k", None).await.unwrap(),
            Some(json!({"v": 1}))
        );
    }
}

// =============================================================================
// Compute-if-absent
// =============================================================================

mod wrap {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let mut config = CacheConfig::default();
        config.single_flight = true;
        let cache = Arc::new(engine(config).cache);
        let calls = Arc::new(AtomicU32::new(0));

        let handles = (0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .wrap("report", CacheOptions::new(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(42u64)
                    })
                    .await
            })
        });

        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_error_is_not_cached() {
        let e = engine(CacheConfig::default());

        let failed = e
            .cache
            .wrap("k", CacheOptions::new(), || async { Err::<u32, _>("backend down") })
            .await;
        assert_matches!(failed, Err(Error::Compute(_)));
        assert!(!e.cache.has("k", None).await.unwrap());

        let value = e
            .cache
            .wrap("k", CacheOptions::new(), || async { Ok::<_, String>(5u32) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}

// =============================================================================
// Warmup
// =============================================================================

mod warmup {
    use super::*;
    use parking_lot::Mutex;
    use tiercache::cache::{FnLoader, WarmupStrategy};

    fn recording(
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> WarmupStrategy {
        WarmupStrategy::new(
            name,
            FnLoader::new(move || {
                let log = log.clone();
                async move {
                    log.lock().push(name);
                    if fail {
                        return Err(Error::Internal("source offline".into()));
                    }
                    Ok(vec![(format!("{name}:seed"), json!(name))])
                }
            }),
        )
        .keys([format!("{name}:seed")])
    }

    #[tokio::test]
    async fn test_priority_order_and_failure_isolation() {
        let e = engine(CacheConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        e.cache.register_strategy(recording("low", log.clone(), false).priority(1));
        e.cache.register_strategy(recording("broken", log.clone(), true).priority(5));
        e.cache.register_strategy(recording("high", log.clone(), false).priority(10));

        let report = e.cache.run_warmup::<&str>(&[], false).await;

        assert_eq!(*log.lock(), vec!["high", "broken", "low"]);
        assert_eq!(report.executed, vec!["high".to_string(), "low".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(report.entries_loaded, 2);
        assert!(e.cache.has("low:seed", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_warm_strategies_are_skipped_unless_forced() {
        let e = engine(CacheConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        e.cache.register_strategy(recording("ref", log.clone(), false));

        e.cache.run_warmup(&["ref"], false).await;
        let report = e.cache.run_warmup(&["ref", "nope"], false).await;
        assert_eq!(report.skipped, vec!["ref".to_string()]);
        assert_eq!(report.unknown, vec!["nope".to_string()]);

        let report = e.cache.run_warmup(&["ref"], true).await;
        assert_eq!(report.executed, vec!["ref".to_string()]);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_config_seeds_run_at_startup() {
        let yaml = r#"
warmup:
  enabled: true
  seeds:
    - name: countries
      priority: 3
      ttlSeconds: 600
      tags: [reference]
      entries:
        - key: "country:pt"
          value: { name: Portugal }
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        let e = engine(config);

        let report = e.cache.run_startup_warmup().await.unwrap();
        assert_eq!(report.executed, vec!["countries".to_string()]);
        assert_eq!(
            e.cache.get::<serde_json::Value>("country:pt", None).await.unwrap(),
            Some(json!({"name": "Portugal"}))
        );
        assert_eq!(e.cache.invalidate_by_tags(["reference"]).await.unwrap(), 1);
    }
}

// =============================================================================
// Monitoring
// =============================================================================

mod monitoring {
    use super::*;
    use tiercache::monitoring::{HealthCheck, HealthStatus, StatsExporter};

    #[tokio::test]
    async fn test_metrics_reflect_cache_activity() {
        let e = engine(CacheConfig::default());
        e.cache.set("a", &1, CacheOptions::new()).await.unwrap();
        let _: Option<i32> = e.cache.get("a", None).await.unwrap();

        let exporter = StatsExporter::new().unwrap();
        exporter.update(&e.cache.stats().await);
        let (_, body) = exporter.encode().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.contains("tiercache_hits{tier=\"local\"} 1"));
        assert!(text.contains("tiercache_keys{tier=\"local\"} 1"));
    }

    #[tokio::test]
    async fn test_readiness_degrades_on_remote_outage() {
        let e = engine(CacheConfig::default());
        let health = HealthCheck::new();
        health.set_ready(true);

        assert_eq!(health.readiness_check(&e.cache).await.status, HealthStatus::Healthy);
        e.store.set_available(false);
        assert_eq!(health.readiness_check(&e.cache).await.status, HealthStatus::Degraded);
    }
}
