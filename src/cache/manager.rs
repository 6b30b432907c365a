//! Cache Manager - Two-Tier Cache Orchestrator
//!
//! The only entry point callers use. Reads go local first, then remote,
//! promoting remote hits into the local tier. Writes go to both tiers;
//! the local write is authoritative when the remote tier is unreachable.
//!
//! # Failure model
//!
//! - A remote outage never fails a `get`: it degrades to a miss
//! - A remote outage never fails a `set` whose local write succeeded
//! - Bulk operations (`invalidate_by_tags`, `clear`) report what they
//!   managed to remove and log the rest

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::codec::Codec;
use super::entry::{CacheEntry, CacheKey, CacheOptions, ResolvedOptions};
use super::local::{LocalRead, LocalTier, PutOutcome};
use super::metrics::{CacheStats, StatsCollector, Tier};
use super::pattern::KeyPattern;
use super::remote::{InMemoryRemoteStore, RedisRemoteStore, RemoteStore, RemoteTier};
use super::tags::TagIndex;
use super::warmup::{WarmupReport, WarmupScheduler, WarmupStrategy};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Whether a lookup updates hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accounting {
    Counted,
    Silent,
}

/// Two-tier cache engine
pub struct CacheManager {
    config: CacheConfig,
    local: LocalTier,
    remote: Arc<RemoteTier>,
    tags: TagIndex,
    codec: Codec,
    stats: StatsCollector,
    warmup: WarmupScheduler,
    /// Per-key locks for `wrap` when single-flight is enabled
    in_flight: DashMap<String, FlightSlot>,
    clock: Arc<dyn Clock>,
}

type FlightSlot = Arc<tokio::sync::Mutex<()>>;

/// Holds a single-flight slot; the last holder to leave removes it
struct FlightGuard<'a> {
    in_flight: &'a DashMap<String, FlightSlot>,
    key: String,
    slot: FlightSlot,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Two references remain when nobody else waits: the map's and ours
        self.in_flight.remove_if(&self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) <= 2
        });
    }
}

impl CacheManager {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Build an engine over an arbitrary remote store
    pub fn with_remote(
        config: CacheConfig,
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Codec::new(&config)?;
        let remote = Arc::new(RemoteTier::new(store, config.remote.key_prefix.clone()));

        let warmup = WarmupScheduler::new();
        for seed in &config.warmup.seeds {
            warmup.register(WarmupStrategy::from_seed(seed));
        }

        Ok(Self {
            local: LocalTier::new(config.local.clone(), Arc::clone(&clock)),
            tags: TagIndex::new(Arc::clone(&remote), Arc::clone(&clock)),
            remote,
            codec,
            stats: StatsCollector::new(),
            warmup,
            in_flight: DashMap::new(),
            clock,
            config,
        })
    }

    /// Build an engine whose remote tier lives in this process
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryRemoteStore::new(Arc::clone(&clock)));
        Self::with_remote(config, store, clock)
    }

    /// Connect to the configured remote endpoint, or fall back to an
    /// in-process remote tier when none is configured
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let Some(endpoint) = config.remote.endpoint.clone() else {
            info!("No remote endpoint configured, using in-process remote tier");
            return Self::in_memory(config);
        };

        let store = RedisRemoteStore::connect(&endpoint, &config.remote).await?;
        Self::with_remote(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Close the remote connection. The local tier keeps serving.
    pub async fn disconnect(&self) -> Result<()> {
        self.remote.close().await?;
        info!("Cache engine disconnected from remote tier");
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up a value. Absence is `Ok(None)`, never an error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, namespace: Option<&str>) -> Result<Option<T>> {
        let full = Self::full_key(key, namespace)?;
        match self.lookup(&full, Accounting::Counted).await {
            Some(plain) => self.codec.deserialize(&plain).map(Some),
            None => Ok(None),
        }
    }

    /// Look up several values with the same accounting as repeated `get`s
    pub async fn mget<T, K>(&self, keys: &[K], namespace: Option<&str>) -> Result<Vec<Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key.as_ref(), namespace).await?);
        }
        Ok(values)
    }

    /// Whether a live entry exists in either tier. Not counted as a hit or miss.
    pub async fn has(&self, key: &str, namespace: Option<&str>) -> Result<bool> {
        let full = Self::full_key(key, namespace)?;
        if self.local.contains(&full) {
            return Ok(true);
        }
        match self.remote.exists(&full).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                warn!(key = %full, error = %e, "Remote existence check failed");
                Ok(false)
            }
        }
    }

    async fn lookup(&self, full: &str, accounting: Accounting) -> Option<Bytes> {
        let counted = accounting == Accounting::Counted;

        let tracker = Instant::now();
        match self.local.read(full) {
            LocalRead::Hit(entry) => {
                if counted {
                    self.stats.record_hit(Tier::Local);
                    self.stats.record_read_latency(Tier::Local, tracker.elapsed());
                }
                debug!(key = %full, tier = %Tier::Local, "Cache hit");
                return Some(entry.data().clone());
            }
            LocalRead::Expired(entry) => {
                self.tags.untrack(entry.key(), entry.tags());
                self.refresh_local_occupancy();
            }
            LocalRead::Miss => {}
        }
        if counted {
            self.stats.record_miss(Tier::Local);
        }

        let tracker = Instant::now();
        let fetched = self.remote.get(full).await;
        if counted {
            self.stats.record_read_latency(Tier::Remote, tracker.elapsed());
        }

        let value = match fetched {
            Ok(Some(value)) => value,
            Ok(None) => {
                if counted {
                    self.stats.record_miss(Tier::Remote);
                }
                debug!(key = %full, "Cache miss");
                return None;
            }
            Err(e) => {
                if counted {
                    self.stats.record_miss(Tier::Remote);
                }
                warn!(key = %full, error = %e, "Remote read failed, treating as miss");
                return None;
            }
        };

        let payload = match self.codec.decode(&value.data) {
            Ok(payload) => payload,
            Err(e) => {
                if counted {
                    self.stats.record_miss(Tier::Remote);
                }
                warn!(key = %full, error = %e, "Undecodable remote payload, treating as miss");
                return None;
            }
        };

        if counted {
            self.stats.record_hit(Tier::Remote);
        }
        debug!(key = %full, tier = %Tier::Remote, "Cache hit");

        self.promote(full, &payload.bytes, value.ttl, payload.compressed, payload.encrypted);
        Some(payload.bytes)
    }

    /// Copy a remote hit into the local tier with its remaining TTL
    fn promote(&self, full: &str, plain: &Bytes, remaining: Option<Duration>, compressed: bool, encrypted: bool) {
        let ttl = match remaining {
            Some(ttl) if ttl.is_zero() => return,
            Some(ttl) => Some(ttl),
            None => match self.config.local.default_ttl_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        let entry = CacheEntry::new(full, plain.clone(), self.clock.now(), ttl)
            .with_encoding_flags(compressed, encrypted);
        match self.local.put(entry) {
            Ok(outcome) => {
                self.release_displaced(&outcome);
                self.stats.record_promotion();
                debug!(key = %full, "Promoted remote entry to local tier");
            }
            Err(e) => warn!(key = %full, error = %e, "Promotion to local tier rejected"),
        }
        self.refresh_local_occupancy();
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value to both tiers.
    ///
    /// Options are validated and the value encoded before any tier is
    /// touched. A remote failure is logged and the local write stands.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: CacheOptions) -> Result<()> {
        let resolved = options.resolve(&self.config)?;
        let full = Self::full_key(key, options.namespace.as_deref())?;
        if resolved.encrypt && !self.codec.encryption_available() {
            return Err(Error::InvalidOptions(
                "encryption requested but encryption is not configured".into(),
            ));
        }

        let plain = self.codec.serialize(value)?;
        let wire = self.codec.encode(&plain, resolved.compress, resolved.encrypt)?;

        let tracker = Instant::now();
        let entry = CacheEntry::new(&full, plain, self.clock.now(), resolved.local_ttl)
            .with_tags(resolved.tags.clone())
            .with_encoding_flags(wire.compressed, wire.encrypted);
        let local_result = self.local.put(entry);
        self.stats.record_write_latency(Tier::Local, tracker.elapsed());

        match &local_result {
            Ok(outcome) => {
                self.release_displaced(outcome);
                self.tags.track(&full, &resolved.tags, resolved.local_ttl);
            }
            // The tier dropped any previous value under this key
            Err(_) => self.tags.remove_key(&full),
        }
        self.refresh_local_occupancy();

        let tracker = Instant::now();
        let remote_result = self.write_remote(&full, wire.bytes, &resolved).await;
        self.stats.record_write_latency(Tier::Remote, tracker.elapsed());

        match (local_result, remote_result) {
            (Ok(_), _) => Ok(()),
            (Err(e), Ok(())) => {
                warn!(key = %full, error = %e, "Local write rejected, value stored remotely only");
                Ok(())
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Untrack entries a local write pushed out and count the evictions
    fn release_displaced(&self, outcome: &PutOutcome) {
        if let Some(old) = &outcome.replaced {
            self.tags.untrack(old.key(), old.tags());
        }
        for evicted in &outcome.evicted {
            self.tags.untrack(evicted.key(), evicted.tags());
        }
        self.stats.record_evictions(Tier::Local, outcome.evicted_count());
    }

    async fn write_remote(&self, full: &str, wire: Bytes, resolved: &ResolvedOptions) -> Result<()> {
        let written = self.remote.set(full, wire, resolved.ttl).await;
        if let Err(e) = &written {
            warn!(key = %full, error = %e, "Remote write failed, local tier is authoritative");
        }

        if !resolved.tags.is_empty() {
            if let Err(e) = self.tags.register(full, &resolved.tags, resolved.ttl).await {
                if written.is_ok() {
                    warn!(key = %full, error = %e, "Tag registration failed");
                }
            }
        }
        written
    }

    /// Write several values with the same options, one `set` each
    pub async fn mset<T, K>(&self, entries: &[(K, T)], options: CacheOptions) -> Result<()>
    where
        T: Serialize,
        K: AsRef<str>,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), value, options.clone()).await?;
        }
        Ok(())
    }

    /// Remove a key from both tiers; true if it existed in either
    pub async fn delete(&self, key: &str, namespace: Option<&str>) -> Result<bool> {
        let full = Self::full_key(key, namespace)?;

        let in_local = self.local.remove(&full).is_some();
        self.tags.remove_key(&full);
        self.refresh_local_occupancy();

        let in_remote = match self.remote.delete(&full).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %full, error = %e, "Remote delete failed");
                false
            }
        };

        debug!(key = %full, existed = in_local || in_remote, "Cache delete");
        Ok(in_local || in_remote)
    }

    /// Remove every key carrying any of `tags`; returns how many keys went.
    ///
    /// Each tag costs one remote round-trip. A key added to a tag while it
    /// is being invalidated may survive.
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(|t| t.as_ref().to_string()).collect();
        if tags.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidOptions("tags must not be empty strings".into()));
        }

        let mut removed = BTreeSet::new();
        for tag in &tags {
            let result = self.tags.invalidate(tag).await;
            if let Some(e) = &result.remote_error {
                warn!(tag = %tag, error = %e, "Remote tag invalidation failed, clearing local members only");
            }

            let remote_deleted: BTreeSet<&String> = result.remote_deleted.iter().collect();
            for key in result.candidates() {
                let in_local = self.local.remove(&key).is_some();
                self.tags.remove_key(&key);
                if in_local || remote_deleted.contains(&key) {
                    removed.insert(key);
                }
            }
        }
        self.refresh_local_occupancy();

        info!(tags = tags.len(), removed = removed.len(), "Invalidated by tags");
        Ok(removed.len() as u64)
    }

    /// Remove keys matching a glob, or everything when `pattern` is `None`.
    ///
    /// An unpatterned clear requires `allowFullClear` in the configuration.
    pub async fn clear(&self, pattern: Option<&str>) -> Result<u64> {
        let (local_removed, remote_result) = match pattern {
            None => {
                if !self.config.allow_full_clear {
                    return Err(Error::InvalidOptions(
                        "full clear is disabled; enable allowFullClear or pass a pattern".into(),
                    ));
                }
                let local_removed = self.local.remove_matching(&KeyPattern::new("*")?);
                self.tags.clear();
                (local_removed, self.remote.clear_all().await)
            }
            Some(pattern) => {
                let pattern = KeyPattern::new(pattern)?;
                let local_removed = self.local.remove_matching(&pattern);
                self.tags.remove_keys_where(|key| pattern.matches(key));
                (local_removed, self.remote.delete_matching(&pattern).await)
            }
        };
        self.refresh_local_occupancy();

        let mut removed: BTreeSet<String> = local_removed.into_iter().collect();
        match remote_result {
            Ok(keys) => removed.extend(keys),
            Err(e) => warn!(pattern = ?pattern, error = %e, "Remote clear failed, local tier cleared only"),
        }

        info!(pattern = ?pattern, removed = removed.len(), "Cache cleared");
        Ok(removed.len() as u64)
    }

    // =========================================================================
    // Compute-if-absent
    // =========================================================================

    /// Return the cached value, or compute, store and return it.
    ///
    /// With `single_flight` enabled, concurrent calls for the same key share
    /// one computation; otherwise each caller that misses computes.
    pub async fn wrap<T, F, Fut, E>(&self, key: &str, options: CacheOptions, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let namespace = options.namespace.as_deref();
        if let Some(value) = self.get(key, namespace).await? {
            return Ok(value);
        }

        if !self.config.single_flight {
            return self.compute_and_store(key, options, compute).await;
        }

        let full = Self::full_key(key, namespace)?;
        let slot = self
            .in_flight
            .entry(full.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = FlightGuard {
            in_flight: &self.in_flight,
            key: full,
            slot,
        };
        let _lock = guard.slot.lock().await;

        // A leader that finished while we waited has already stored the value
        if let Some(plain) = self.lookup(&guard.key, Accounting::Silent).await {
            return self.codec.deserialize(&plain);
        }

        self.compute_and_store(key, options, compute).await
    }

    async fn compute_and_store<T, F, Fut, E>(&self, key: &str, options: CacheOptions, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let value = compute().await.map_err(Error::compute)?;

        match self.set(key, &value, options).await {
            Ok(()) => {}
            Err(e @ (Error::CapacityExceeded { .. } | Error::RemoteUnavailable(_))) => {
                warn!(key = %key, error = %e, "Computed value not cached");
            }
            Err(e) => return Err(e),
        }
        Ok(value)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Point-in-time stats snapshot, with occupancy refreshed first
    pub async fn stats(&self) -> CacheStats {
        self.refresh_local_occupancy();
        match self.remote.info().await {
            Ok(info) => self
                .stats
                .update_occupancy(Tier::Remote, info.key_count, info.memory_bytes),
            Err(e) => debug!(error = %e, "Remote occupancy unavailable"),
        }
        self.stats.snapshot()
    }

    /// Zero hit/miss/eviction counters
    pub fn reset_metrics(&self) {
        self.stats.reset();
        info!("Cache metrics reset");
    }

    fn refresh_local_occupancy(&self) {
        self.stats
            .update_occupancy(Tier::Local, self.local.len() as u64, self.local.size_bytes());
    }

    /// Probe the remote tier
    pub async fn ping_remote(&self) -> Result<()> {
        self.remote.ping().await
    }

    // =========================================================================
    // Warmup
    // =========================================================================

    /// Register a warmup strategy (replacing one with the same name)
    pub fn register_strategy(&self, strategy: WarmupStrategy) {
        self.warmup.register(strategy);
    }

    /// Run named strategies; an empty list runs all of them
    pub async fn run_warmup<S: AsRef<str>>(&self, names: &[S], force: bool) -> WarmupReport {
        self.warmup.run(self, names, force).await
    }

    /// Run the strategies configured for startup, if warmup is enabled
    pub async fn run_startup_warmup(&self) -> Option<WarmupReport> {
        if !self.config.warmup.enabled {
            return None;
        }
        let names = self.config.warmup.strategies.clone();
        Some(self.run_warmup(&names, false).await)
    }

    fn full_key(key: &str, namespace: Option<&str>) -> Result<String> {
        let key = CacheKey::with_namespace(key, namespace);
        key.validate()?;
        Ok(key.full_key())
    }
}

// =============================================================================
// Tests
// =============================================================================
