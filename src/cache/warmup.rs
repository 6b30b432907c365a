//! Warmup Scheduler
//!
//! Named strategies that precompute entries before traffic arrives.
//! Strategies run by descending priority; ties keep registration order.
//! A failing loader is logged and skipped without stopping the others.

use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::CacheOptions;
use super::manager::CacheManager;
use crate::config::{SeedEntry, SeedStrategyConfig};
use crate::error::{Error, Result};

/// Produces the key/value pairs a strategy writes
#[async_trait]
pub trait WarmupLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Loader backed by an async closure
pub struct FnLoader<F> {
    load: F,
}

impl<F, Fut> FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<(String, serde_json::Value)>>> + Send,
{
    pub fn new(load: F) -> Self {
        Self { load }
    }
}

#[async_trait]
impl<F, Fut> WarmupLoader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<(String, serde_json::Value)>>> + Send,
{
    async fn load(&self) -> Result<Vec<(String, serde_json::Value)>> {
        (self.load)().await
    }
}

/// Loader returning literal entries from configuration
pub struct SeedLoader {
    entries: Vec<SeedEntry>,
}

impl SeedLoader {
    pub fn new(entries: Vec<SeedEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl WarmupLoader for SeedLoader {
    async fn load(&self) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect())
    }
}

/// A named warmup strategy
#[derive(Clone)]
pub struct WarmupStrategy {
    name: String,
    priority: i32,
    keys: Vec<String>,
    options: CacheOptions,
    loader: Arc<dyn WarmupLoader>,
}

impl WarmupStrategy {
    pub fn new(name: impl Into<String>, loader: impl WarmupLoader + 'static) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            keys: Vec::new(),
            options: CacheOptions::default(),
            loader: Arc::new(loader),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Keys the strategy populates; when all are present it is skipped
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Options applied to every entry the loader returns
    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Build a strategy from a configured seed
    pub fn from_seed(seed: &SeedStrategyConfig) -> Self {
        let mut options = CacheOptions::new().tags(seed.tags.iter().cloned());
        options.ttl_seconds = seed.ttl_seconds;
        options.namespace = seed.namespace.clone();

        Self::new(seed.name.clone(), SeedLoader::new(seed.entries.clone()))
            .priority(seed.priority)
            .keys(seed.entries.iter().map(|entry| entry.key.clone()))
            .options(options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WarmupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Outcome of a warmup run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupReport {
    /// Strategies whose loader ran, in execution order
    pub executed: Vec<String>,
    /// Strategies skipped because their keys were already present
    pub skipped: Vec<String>,
    /// Strategies whose loader failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Requested names with no registered strategy
    pub unknown: Vec<String>,
    /// Entries written
    pub entries_loaded: u64,
    /// Entries the loader returned but `set` rejected
    pub entries_failed: u64,
}

/// Registry of strategies in declaration order
#[derive(Default)]
pub struct WarmupScheduler {
    strategies: RwLock<Vec<WarmupStrategy>>,
}

impl WarmupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy; a strategy with the same name is replaced in place
    pub fn register(&self, strategy: WarmupStrategy) {
        let mut strategies = self.strategies.write();
        match strategies.iter_mut().find(|s| s.name == strategy.name) {
            Some(existing) => *existing = strategy,
            None => strategies.push(strategy),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Resolve and order strategies. An empty name list selects all.
    pub fn plan<S: AsRef<str>>(&self, names: &[S]) -> (Vec<WarmupStrategy>, Vec<String>) {
        let strategies = self.strategies.read();
        let mut unknown = Vec::new();

        let mut selected: Vec<WarmupStrategy> = if names.is_empty() {
            strategies.clone()
        } else {
            for name in names {
                let name = name.as_ref();
                if !strategies.iter().any(|s| s.name == name) && !unknown.iter().any(|u| u == name) {
                    unknown.push(name.to_string());
                }
            }
            strategies
                .iter()
                .filter(|s| names.iter().any(|n| n.as_ref() == s.name))
                .cloned()
                .collect()
        };

        // Stable sort keeps declaration order among equal priorities
        selected.sort_by_key(|s| Reverse(s.priority));
        (selected, unknown)
    }

    /// Run the named strategies against `cache`
    pub async fn run<S: AsRef<str>>(&self, cache: &CacheManager, names: &[S], force: bool) -> WarmupReport {
        let started = Instant::now();
        let (plan, unknown) = self.plan(names);
        let mut report = WarmupReport {
            unknown,
            ..Default::default()
        };

        for name in &report.unknown {
            warn!(strategy = %name, "Unknown warmup strategy");
        }

        for strategy in plan {
            if !force && already_warm(cache, &strategy).await {
                debug!(strategy = %strategy.name, "Warmup skipped, keys already present");
                report.skipped.push(strategy.name);
                continue;
            }

            let entries = match strategy.loader.load().await {
                Ok(entries) => entries,
                Err(e) => {
                    let e = if matches!(e, Error::Warmup { .. }) {
                        e
                    } else {
                        Error::Warmup {
                            strategy: strategy.name.clone(),
                            reason: e.to_string(),
                        }
                    };
                    warn!(strategy = %strategy.name, error = %e, "Warmup strategy failed");
                    report.failed.push((strategy.name, e.to_string()));
                    continue;
                }
            };

            for (key, value) in entries {
                match cache.set(&key, &value, strategy.options.clone()).await {
                    Ok(()) => report.entries_loaded += 1,
                    Err(e) => {
                        warn!(strategy = %strategy.name, key = %key, error = %e, "Warmup entry rejected");
                        report.entries_failed += 1;
                    }
                }
            }
            report.executed.push(strategy.name);
        }

        info!(
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            entries = report.entries_loaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Warmup finished"
        );
        report
    }
}

async fn already_warm(cache: &CacheManager, strategy: &WarmupStrategy) -> bool {
    if strategy.keys.is_empty() {
        return false;
    }
    let namespace = strategy.options.namespace.as_deref();
    for key in &strategy.keys {
        if !cache.has(key, namespace).await.unwrap_or(false) {
            return false;
        }
    }
    true
}
