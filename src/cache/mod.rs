//! Two-Tier Cache Engine
//!
//! A bounded in-process tier in front of a shared remote tier, coordinated
//! by [`CacheManager`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Local Tier            │  Remote Tier               │  Tag Index         │
//! │  ┌──────────────────┐  │  ┌──────────────────────┐  │  ┌──────────────┐  │
//! │  │ LRU map + bytes  │  │  │ Redis / in-memory    │  │  │ remote sets  │  │
//! │  │ bound, lazy TTL  │  │  │ native expiry        │  │  │ + local      │  │
//! │  └──────────────────┘  │  └──────────────────────┘  │  │   mirror     │  │
//! │          ▲             │             ▲              │  └──────────────┘  │
//! │          └── promotion ┴─────────────┘              │                    │
//! │                                                                          │
//! │  Codec: JSON ─▶ [lz4:] compression ─▶ [enc:] AES-256-GCM                 │
//! │  Stats Collector · Warmup Scheduler                                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tiercache::cache::{CacheManager, CacheOptions};
//! use tiercache::config::CacheConfig;
//!
//! # async fn demo() -> tiercache::Result<()> {
//! let cache = CacheManager::connect(CacheConfig::default()).await?;
//!
//! cache
//!     .set("user:42", &"Ana", CacheOptions::new().ttl(60).tag("users"))
//!     .await?;
//! let name: Option<String> = cache.get("user:42", None).await?;
//! assert_eq!(name.as_deref(), Some("Ana"));
//!
//! cache.invalidate_by_tags(["users"]).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod compression;
pub mod encryption;
mod entry;
mod local;
mod manager;
mod metrics;
pub mod pattern;
pub mod remote;
mod tags;
mod warmup;


pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{clamp_ttl, CacheEntry, CacheKey, CacheOptions, ResolvedOptions, NAMESPACE_SEPARATOR};
pub use local::{LocalRead, LocalTier, PutOutcome};
pub use manager::CacheManager;
pub use metrics::{AggregateStats, CacheStats, StatsCollector, Tier, TierStats};
pub use remote::{InMemoryRemoteStore, RedisRemoteStore, RemoteInfo, RemoteStore, RemoteTier, RemoteValue};
pub use tags::{TagIndex, TagInvalidation};
pub use warmup::{FnLoader, SeedLoader, WarmupLoader, WarmupReport, WarmupScheduler, WarmupStrategy};
