//! tiercache - Two-Tier Cache Engine
//!
//! A bounded in-process LRU tier in front of a shared remote tier (Redis),
//! with tag-based invalidation, transparent compression and encryption,
//! compute-on-miss with optional single-flight, warmup strategies and
//! per-tier statistics.
//!
//! # Modules
//!
//! - [`cache`] - The engine: tiers, codec, tag index, stats, warmup
//! - [`config`] - Typed configuration, loadable from YAML
//! - [`error`] - Error types
//! - [`monitoring`] - Health probes and Prometheus export

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{CacheManager, CacheOptions, CacheStats};
pub use config::CacheConfig;
pub use error::{Error, Result};
