//! Prometheus export of cache stats
//!
//! Stats can be reset at runtime, so every series is a gauge mirroring the
//! latest snapshot rather than a Prometheus counter.

use prometheus::{
    register_gauge_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::cache::{CacheStats, Tier};
use crate::error::{Error, Result};

/// Registry of cache gauges labelled by tier
pub struct StatsExporter {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    evictions: IntGaugeVec,
    keys: IntGaugeVec,
    bytes: IntGaugeVec,
    hit_rate: GaugeVec,
    promotions: IntGauge,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {e}"))
}

impl StatsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let tier = &["tier"];

        Ok(Self {
            hits: register_int_gauge_vec_with_registry!(
                Opts::new("tiercache_hits", "Cache hits since last reset"),
                tier,
                registry
            )
            .map_err(metric_error)?,
            misses: register_int_gauge_vec_with_registry!(
                Opts::new("tiercache_misses", "Cache misses since last reset"),
                tier,
                registry
            )
            .map_err(metric_error)?,
            evictions: register_int_gauge_vec_with_registry!(
                Opts::new("tiercache_evictions", "Evictions since last reset"),
                tier,
                registry
            )
            .map_err(metric_error)?,
            keys: register_int_gauge_vec_with_registry!(
                Opts::new("tiercache_keys", "Resident keys"),
                tier,
                registry
            )
            .map_err(metric_error)?,
            bytes: register_int_gauge_vec_with_registry!(
                Opts::new("tiercache_memory_bytes", "Resident bytes"),
                tier,
                registry
            )
            .map_err(metric_error)?,
            hit_rate: register_gauge_vec_with_registry!(
                Opts::new("tiercache_hit_rate", "Hit rate in [0, 1]"),
                &["scope"],
                registry
            )
            .map_err(metric_error)?,
            promotions: register_int_gauge_with_registry!(
                Opts::new("tiercache_promotions", "Remote hits promoted to the local tier"),
                registry
            )
            .map_err(metric_error)?,
            registry,
        })
    }

    /// Mirror a snapshot into the gauges
    pub fn update(&self, stats: &CacheStats) {
        for tier in [Tier::Local, Tier::Remote] {
            let label = [tier.as_str()];
            let t = stats.tier(tier);
            self.hits.with_label_values(&label).set(t.hits as i64);
            self.misses.with_label_values(&label).set(t.misses as i64);
            self.evictions.with_label_values(&label).set(t.evictions as i64);
            self.keys.with_label_values(&label).set(t.key_count as i64);
            self.bytes.with_label_values(&label).set(t.memory_bytes as i64);
            self.hit_rate.with_label_values(&label).set(t.hit_rate());
        }
        self.hit_rate.with_label_values(&["aggregate"]).set(stats.hit_rate());
        self.promotions.set(stats.promotions as i64);
    }

    /// Render in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {e}")))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
