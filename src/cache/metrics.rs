//! Cache Metrics Collection
//!
//! Running counters per tier, exposed as point-in-time snapshots.
//!
//! Increments hold a shared gate and `snapshot`/`reset` hold it
//! exclusively, so an increment lands entirely before or after a reset and
//! a snapshot never mixes counters from either side of one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Remote => "remote",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    key_count: AtomicU64,
    memory_bytes: AtomicU64,
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            key_count: self.key_count.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
            write_latency_us: self.write_latency_us.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.read_latency_us,
            &self.write_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Stats collector shared by every engine operation
#[derive(Debug, Default)]
pub struct StatsCollector {
    gate: RwLock<()>,
    local: TierCounters,
    remote: TierCounters,
    promotions: AtomicU64,
}

impl StatsCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: Tier) -> &TierCounters {
        match tier {
            Tier::Local => &self.local,
            Tier::Remote => &self.remote,
        }
    }

    pub fn record_hit(&self, tier: Tier) {
        let _gate = self.gate.read();
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: Tier) {
        let _gate = self.gate.read();
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, tier: Tier, count: u64) {
        if count == 0 {
            return;
        }
        let _gate = self.gate.read();
        self.tier(tier).evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        let _gate = self.gate.read();
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Occupancy gauges; these describe current state and survive resets
    pub fn update_occupancy(&self, tier: Tier, key_count: u64, memory_bytes: u64) {
        let counters = self.tier(tier);
        counters.key_count.store(key_count, Ordering::Relaxed);
        counters.memory_bytes.store(memory_bytes, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, tier: Tier, duration: Duration) {
        let _gate = self.gate.read();
        update_latency_ema(&self.tier(tier).read_latency_us, duration);
    }

    pub fn record_write_latency(&self, tier: Tier, duration: Duration) {
        let _gate = self.gate.read();
        update_latency_ema(&self.tier(tier).write_latency_us, duration);
    }

    /// Consistent point-in-time snapshot
    pub fn snapshot(&self) -> CacheStats {
        let _gate = self.gate.write();
        CacheStats::new(
            self.local.snapshot(),
            self.remote.snapshot(),
            self.promotions.load(Ordering::Relaxed),
        )
    }

    /// Zero every counter
    pub fn reset(&self) {
        let _gate = self.gate.write();
        self.local.reset();
        self.remote.reset();
        self.promotions.store(0, Ordering::Relaxed);
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Counters for one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub key_count: u64,
    pub memory_bytes: u64,
    pub read_latency_us: u64,
    pub write_latency_us: u64,
}

impl TierStats {
    /// `hits / (hits + misses)`, or 0 when there were no lookups
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Engine-wide view.
///
/// Every `get` ends in exactly one aggregate outcome: a hit in some tier, or
/// a final miss once the remote tier missed too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub key_count: u64,
    pub memory_bytes: u64,
}

impl AggregateStats {
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }
}

/// Snapshot of all stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub local: TierStats,
    pub remote: TierStats,
    pub aggregate: AggregateStats,
    pub promotions: u64,
}

impl CacheStats {
    fn new(local: TierStats, remote: TierStats, promotions: u64) -> Self {
        let aggregate = AggregateStats {
            hits: local.hits + remote.hits,
            misses: remote.misses,
            evictions: local.evictions + remote.evictions,
            key_count: local.key_count + remote.key_count,
            memory_bytes: local.memory_bytes + remote.memory_bytes,
        };
        Self {
            local,
            remote,
            aggregate,
            promotions,
        }
    }

    pub fn tier(&self, tier: Tier) -> &TierStats {
        match tier {
            Tier::Local => &self.local,
            Tier::Remote => &self.remote,
        }
    }

    /// Overall hit rate
    pub fn hit_rate(&self) -> f64 {
        self.aggregate.hit_rate()
    }
}

// =============================================================================
// Tests
// =============================================================================
