//! Local Tier - bounded in-process cache
//!
//! A single LRU map guarded by one mutex. Both an entry-count and an
//! aggregate byte bound apply; whichever is exceeded first triggers eviction
//! of the least recently used entries.
//!
//! # Design
//!
//! - `get` and `put` refresh recency; `contains` does not
//! - Expiry is lazy: an expired entry is dropped when a read finds it
//! - All operations are O(1) amortized except pattern scans

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::clock::Clock;
use super::entry::CacheEntry;
use super::pattern::KeyPattern;
use crate::config::LocalConfig;
use crate::error::{Error, Result};

struct LocalState {
    entries: LruCache<String, CacheEntry>,
    size_bytes: u64,
}

impl LocalState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key)?;
        self.size_bytes -= removed.size();
        Some(removed)
    }
}

/// Outcome of a successful local write
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    /// Entries evicted to make room, least recently used first
    pub evicted: Vec<CacheEntry>,
    /// The entry previously stored under the same key
    pub replaced: Option<CacheEntry>,
}

impl PutOutcome {
    pub fn evicted_count(&self) -> u64 {
        self.evicted.len() as u64
    }
}

/// Result of a local read
#[derive(Debug, Clone)]
pub enum LocalRead {
    Hit(CacheEntry),
    /// The entry had expired and was dropped by this read
    Expired(CacheEntry),
    Miss,
}

impl LocalRead {
    pub fn hit(self) -> Option<CacheEntry> {
        match self {
            LocalRead::Hit(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Local tier
pub struct LocalTier {
    state: Mutex<LocalState>,
    config: LocalConfig,
    clock: Arc<dyn Clock>,
}

impl LocalTier {
    pub fn new(config: LocalConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LocalState {
                entries: LruCache::unbounded(),
                size_bytes: 0,
            }),
            config,
            clock,
        }
    }

    /// Get a live entry, refreshing its recency
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read(key).hit()
    }

    /// Like `get`, but hands back an expired entry the read dropped
    pub fn read(&self, key: &str) -> LocalRead {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return LocalRead::Hit(entry.clone()),
            Some(_) => {}
            None => return LocalRead::Miss,
        }
        match state.remove(key) {
            Some(expired) => LocalRead::Expired(expired),
            None => LocalRead::Miss,
        }
    }

    /// Insert or replace an entry, evicting LRU entries to stay in bounds.
    ///
    /// An entry larger than `max_bytes` is rejected with `CapacityExceeded`;
    /// any previous value under the same key is dropped so it cannot be
    /// served stale.
    pub fn put(&self, entry: CacheEntry) -> Result<PutOutcome> {
        let size = entry.size();
        let mut state = self.state.lock();

        if size > self.config.max_bytes {
            state.remove(entry.key());
            return Err(Error::CapacityExceeded {
                size,
                limit: self.config.max_bytes,
            });
        }

        let key = entry.key().to_string();
        let replaced = state.entries.put(key, entry);
        if let Some(old) = &replaced {
            state.size_bytes -= old.size();
        }
        state.size_bytes += size;

        let mut evicted = Vec::new();
        while state.entries.len() > self.config.max_entries
            || state.size_bytes > self.config.max_bytes
        {
            match state.entries.pop_lru() {
                Some((_, old)) => {
                    state.size_bytes -= old.size();
                    evicted.push(old);
                }
                None => break,
            }
        }

        Ok(PutOutcome { evicted, replaced })
    }

    /// Remove an entry; returns it only if it was still live
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let removed = self.state.lock().remove(key)?;
        (!removed.is_expired_at(now)).then_some(removed)
    }

    /// Live-entry check that leaves recency untouched
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Remove every physically present key matching `pattern`
    pub fn remove_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        let mut state = self.state.lock();
        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            state.remove(key);
        }
        matching
    }

    /// Drop everything; returns the number of entries removed
    pub fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        let count = state.entries.len() as u64;
        state.entries.clear();
        state.size_bytes = 0;
        count
    }

    /// Number of resident entries (expired ones included until touched)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate size of resident entries
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().size_bytes
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use bytes::Bytes;
    use std::time::Duration;

    fn tier(max_entries: usize, max_bytes: u64) -> (LocalTier, ManualClock) {
        let clock = ManualClock::new();
        let tier = LocalTier::new(
            LocalConfig {
                max_entries,
                max_bytes,
                default_ttl_seconds: 0,
            },
            Arc::new(clock.clone()),
        );
        (tier, clock)
    }

    fn entry(clock: &ManualClock, key: &str, data: &[u8], ttl: Option<u64>) -> CacheEntry {
        CacheEntry::new(
            key,
            Bytes::copy_from_slice(data),
            clock.now(),
            ttl.map(Duration::from_secs),
        )
    }

    #[test]
    fn test_put_get() {
        let (tier, clock) = tier(10, 1024);
        tier.put(entry(&clock, "a", b"hello", None)).unwrap();

        let got = tier.get("a").unwrap();
        assert_eq!(got.data().as_ref(), b"hello");
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), 6);
    }

    #[test]
    fn test_entry_count_eviction() {
        let (tier, clock) = tier(1, 1024);
        tier.put(entry(&clock, "x", b"1", None)).unwrap();
        let outcome = tier.put(entry(&clock, "y", b"2", None)).unwrap();

        assert_eq!(outcome.evicted_count(), 1);
        assert_eq!(outcome.evicted[0].key(), "x");
        assert!(tier.get("x").is_none());
        assert_eq!(tier.get("y").unwrap().data().as_ref(), b"2");
    }

    #[test]
    fn test_byte_bound_eviction() {
        let (tier, clock) = tier(100, 30);
        for key in ["a", "b", "c"] {
            tier.put(entry(&clock, key, &[0u8; 9], None)).unwrap();
        }
        assert_eq!(tier.size_bytes(), 30);

        tier.put(entry(&clock, "d", &[0u8; 9], None)).unwrap();
        assert!(tier.size_bytes() <= 30);
        assert!(!tier.contains("a"));
        assert!(tier.contains("d"));
    }

    #[test]
    fn test_get_refreshes_recency() {
        let (tier, clock) = tier(2, 1024);
        tier.put(entry(&clock, "a", b"1", None)).unwrap();
        tier.put(entry(&clock, "b", b"2", None)).unwrap();

        // Touch "a" so "b" becomes least recently used
        tier.get("a");
        tier.put(entry(&clock, "c", b"3", None)).unwrap();

        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.contains("c"));
    }

    #[test]
    fn test_contains_does_not_refresh_recency() {
        let (tier, clock) = tier(2, 1024);
        tier.put(entry(&clock, "a", b"1", None)).unwrap();
        tier.put(entry(&clock, "b", b"2", None)).unwrap();

        assert!(tier.contains("a"));
        tier.put(entry(&clock, "c", b"3", None)).unwrap();

        assert!(!tier.contains("a"));
    }

    #[test]
    fn test_lazy_expiry() {
        let (tier, clock) = tier(10, 1024);
        tier.put(entry(&clock, "k", b"v", Some(5))).unwrap();

        clock.advance_secs(4);
        assert!(tier.get("k").is_some());

        clock.advance_secs(2);
        assert_eq!(tier.len(), 1); // still resident
        assert!(!tier.contains("k"));
        assert!(tier.get("k").is_none());
        assert_eq!(tier.len(), 0); // dropped by the read
    }

    #[test]
    fn test_read_reports_expired_entry() {
        let (tier, clock) = tier(10, 1024);
        tier.put(entry(&clock, "k", b"v", Some(1))).unwrap();
        assert!(matches!(tier.read("k"), LocalRead::Hit(_)));

        clock.advance_secs(2);
        match tier.read("k") {
            LocalRead::Expired(old) => assert_eq!(old.key(), "k"),
            other => panic!("expected expired entry, got {other:?}"),
        }
        assert!(matches!(tier.read("k"), LocalRead::Miss));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let (tier, clock) = tier(10, 16);
        tier.put(entry(&clock, "k", b"small", None)).unwrap();

        let err = tier.put(entry(&clock, "k", &[0u8; 64], None)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 16, .. }));
        // Previous value is not left behind
        assert!(tier.get("k").is_none());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_replace_updates_size() {
        let (tier, clock) = tier(10, 1024);
        tier.put(entry(&clock, "k", b"original", None)).unwrap();
        let outcome = tier.put(entry(&clock, "k", b"replaced content", None)).unwrap();

        assert_eq!(outcome.replaced.unwrap().data().as_ref(), b"original");
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), 17);
    }

    #[test]
    fn test_remove_expired_reports_absent() {
        let (tier, clock) = tier(10, 1024);
        tier.put(entry(&clock, "k", b"v", Some(1))).unwrap();
        clock.advance_secs(2);

        assert!(tier.remove("k").is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn test_remove_matching() {
        let (tier, clock) = tier(10, 1024);
        for key in ["user:1", "user:2", "order:1"] {
            tier.put(entry(&clock, key, b"v", None)).unwrap();
        }

        let mut removed = tier.remove_matching(&KeyPattern::new("user:*").unwrap());
        removed.sort();
        assert_eq!(removed, vec!["user:1".to_string(), "user:2".to_string()]);
        assert!(tier.contains("order:1"));
    }

    #[test]
    fn test_clear() {
        let (tier, clock) = tier(100, 10_000);
        for i in 0..10 {
            tier.put(entry(&clock, &format!("k{i}"), &[0u8; 10], None)).unwrap();
        }
        assert_eq!(tier.clear(), 10);
        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let clock = ManualClock::new();
        let tier = Arc::new(LocalTier::new(
            LocalConfig {
                max_entries: 10_000,
                max_bytes: 10 * 1024 * 1024,
                default_ttl_seconds: 0,
            },
            Arc::new(clock.clone()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tier = Arc::clone(&tier);
                let clock = clock.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("obj-{t}-{i}");
                        tier.put(entry(&clock, &key, &[i as u8; 16], None)).unwrap();
                        assert!(tier.get(&key).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tier.len(), 4000);
    }
}
