//! Tag Index
//!
//! Maps each tag to the set of keys carrying it, so bulk invalidation never
//! scans the keyspace. The authoritative sets live in the remote tier; a
//! local mirror keeps invalidation working for locally cached members while
//! the remote tier is unreachable.
//!
//! The mirror only ever holds keys resident in the local tier: the manager
//! tracks a key when the local write lands and untracks it when the entry is
//! evicted, expires, is replaced or is removed.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::clock::Clock;
use super::remote::RemoteTier;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct TagEntry {
    keys: HashSet<String>,
    /// `None` = no expiry
    expires_at: Option<DateTime<Utc>>,
}

impl TagEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Result of invalidating a single tag
#[derive(Debug, Default)]
pub struct TagInvalidation {
    /// Keys the remote tier reported deleted
    pub remote_deleted: Vec<String>,
    /// Members known to the local mirror
    pub mirrored: Vec<String>,
    /// Set when the remote half failed
    pub remote_error: Option<Error>,
}

impl TagInvalidation {
    /// Every key that may still be cached locally
    pub fn candidates(&self) -> BTreeSet<String> {
        self.remote_deleted
            .iter()
            .chain(self.mirrored.iter())
            .cloned()
            .collect()
    }
}

/// Tag to key-set index
pub struct TagIndex {
    mirror: DashMap<String, TagEntry>,
    remote: Arc<RemoteTier>,
    clock: Arc<dyn Clock>,
}

impl TagIndex {
    pub fn new(remote: Arc<RemoteTier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            mirror: DashMap::new(),
            remote,
            clock,
        }
    }

    /// Add `key` to every tag's remote set
    pub async fn register(&self, key: &str, tags: &BTreeSet<String>, ttl: Option<Duration>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.remote.register_tags(key, tags, ttl).await
    }

    /// Mirror a locally resident `key` under every tag
    pub fn track(&self, key: &str, tags: &BTreeSet<String>, ttl: Option<Duration>) {
        let now = self.clock.now();
        let requested = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));

        for tag in tags {
            let mut entry = self.mirror.entry(tag.clone()).or_insert_with(|| TagEntry {
                keys: HashSet::new(),
                expires_at: requested,
            });

            if !entry.is_live(now) {
                entry.keys.clear();
                entry.expires_at = requested;
            }
            entry.keys.insert(key.to_string());
            // Extend, never shorten
            entry.expires_at = match (entry.expires_at, requested) {
                (Some(current), Some(new)) => Some(current.max(new)),
                _ => None,
            };
        }
    }

    /// Drop `key` from the given mirrored tags; emptied tags are destroyed
    pub fn untrack<'a, I>(&self, key: &str, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.mirror.remove_if_mut(tag, |_, entry| {
                entry.keys.remove(key);
                entry.keys.is_empty()
            });
        }
    }

    /// Number of keys mirrored across all tags
    pub fn tracked_keys(&self) -> usize {
        self.mirror.iter().map(|entry| entry.keys.len()).sum()
    }

    /// Invalidate one tag in both the remote sets and the mirror
    pub async fn invalidate(&self, tag: &str) -> TagInvalidation {
        let mirrored = self.take_local(tag);

        match self.remote.invalidate_tag(tag).await {
            Ok(remote_deleted) => TagInvalidation {
                remote_deleted,
                mirrored,
                remote_error: None,
            },
            Err(e) => TagInvalidation {
                remote_deleted: Vec::new(),
                mirrored,
                remote_error: Some(e),
            },
        }
    }

    fn take_local(&self, tag: &str) -> Vec<String> {
        let now = self.clock.now();
        match self.mirror.remove(tag) {
            Some((_, entry)) if entry.is_live(now) => entry.keys.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Drop `key` from every mirrored tag; empty tags are destroyed
    pub fn remove_key(&self, key: &str) {
        self.mirror.retain(|_, entry| {
            entry.keys.remove(key);
            !entry.keys.is_empty()
        });
    }

    /// Drop mirrored keys matching a predicate
    pub fn remove_keys_where(&self, mut predicate: impl FnMut(&str) -> bool) {
        self.mirror.retain(|_, entry| {
            entry.keys.retain(|key| !predicate(key));
            !entry.keys.is_empty()
        });
    }

    /// Forget every mirrored tag
    pub fn clear(&self) {
        self.mirror.clear();
    }

    /// Live mirrored members of a tag
    pub fn members(&self, tag: &str) -> BTreeSet<String> {
        let now = self.clock.now();
        self.mirror
            .get(tag)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expiry of a mirrored tag (`Some(None)` = no expiry)
    pub fn expires_at(&self, tag: &str) -> Option<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        self.mirror
            .get(tag)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at)
    }

    /// Number of mirrored tags
    pub fn len(&self) -> usize {
        self.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.is_empty()
    }
}
