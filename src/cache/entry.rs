//! Cache Entry Types
//!
//! Keys, per-operation options and the resident entry record.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Separator between a caller-supplied namespace and the key
pub const NAMESPACE_SEPARATOR: char = ':';

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key - optional namespace plus an opaque key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Option<String>,
    key: String,
}

impl CacheKey {
    /// Create a key without a namespace
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            namespace: None,
            key: key.into(),
        }
    }

    /// Create a key inside a namespace
    pub fn namespaced(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            key: key.into(),
        }
    }

    /// Create from an optional namespace
    pub fn with_namespace(key: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            key: key.into(),
        }
    }

    /// Reject empty keys and empty namespaces
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidOptions("cache key must not be empty".into()));
        }
        if matches!(self.namespace.as_deref(), Some("")) {
            return Err(Error::InvalidOptions("namespace must not be empty".into()));
        }
        Ok(())
    }

    /// Key without namespace
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Namespace, if any
    #[inline]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Fully qualified key as stored in the tiers
    pub fn full_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}{}{}", ns, NAMESPACE_SEPARATOR, self.key),
            None => self.key.clone(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_key())
    }
}

// =============================================================================
// Cache Options
// =============================================================================

/// Per-operation options. Every field is optional and falls back to the
/// engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// TTL in seconds; `0` means "no expiry" (still clamped to the maximum)
    pub ttl_seconds: Option<i64>,
    /// `Some(true)` forces compression, `Some(false)` forbids it
    pub compress: Option<bool>,
    /// Encrypt the remote payload
    pub encrypt: Option<bool>,
    /// Tags for bulk invalidation
    pub tags: BTreeSet<String>,
    /// Namespace prefix for the key
    pub namespace: Option<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, seconds: i64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Validate and resolve against the engine configuration.
    ///
    /// Runs before any tier is touched.
    pub fn resolve(&self, config: &CacheConfig) -> Result<ResolvedOptions> {
        if let Some(ttl) = self.ttl_seconds {
            if ttl < 0 {
                return Err(Error::InvalidOptions(format!(
                    "ttlSeconds must not be negative, got {ttl}"
                )));
            }
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidOptions("tags must not be empty strings".into()));
        }
        if matches!(self.namespace.as_deref(), Some("")) {
            return Err(Error::InvalidOptions("namespace must not be empty".into()));
        }

        let requested = self.ttl_seconds.map(|t| t as u64);
        let max = config.max_ttl_seconds;

        Ok(ResolvedOptions {
            ttl: clamp_ttl(requested.unwrap_or(config.default_ttl_seconds), max),
            local_ttl: clamp_ttl(
                requested.unwrap_or(config.local.default_ttl_seconds),
                max,
            ),
            compress: self.compress,
            encrypt: self.encrypt.unwrap_or(false),
            tags: self.tags.clone(),
        })
    }
}

/// Apply the maximum TTL clamp. `0` means no expiry and is clamped too when a
/// maximum is configured.
pub fn clamp_ttl(seconds: u64, max_seconds: u64) -> Option<Duration> {
    let effective = if max_seconds > 0 && (seconds == 0 || seconds > max_seconds) {
        max_seconds
    } else {
        seconds
    };

    if effective == 0 {
        None
    } else {
        Some(Duration::from_secs(effective))
    }
}

/// Options after validation and defaulting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    /// Remote TTL (`None` = no expiry)
    pub ttl: Option<Duration>,
    /// Local TTL (`None` = no expiry)
    pub local_ttl: Option<Duration>,
    pub compress: Option<bool>,
    pub encrypt: bool,
    pub tags: BTreeSet<String>,
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A resident cache entry.
///
/// `value` always holds the plain serialized bytes; `compressed` and
/// `encrypted` record how the remote copy was written.
#[derive(Clone)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    compressed: bool,
    encrypted: bool,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    tags: BTreeSet<String>,
    size_bytes: u64,
}

impl CacheEntry {
    /// Create a new entry expiring `ttl` after `now` (`None` = never)
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        let key = key.into();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let size_bytes = (key.len() + value.len()) as u64;

        Self {
            key,
            value,
            compressed: false,
            encrypted: false,
            created_at: now,
            expires_at,
            tags: BTreeSet::new(),
            size_bytes,
        }
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_encoding_flags(mut self, compressed: bool, encrypted: bool) -> Self {
        self.compressed = compressed;
        self.encrypted = encrypted;
        self
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Plain serialized value (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// An entry at or past its expiry is logically absent
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Time left before expiry (`None` = never expires)
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.size_bytes)
            .field("compressed", &self.compressed)
            .field("encrypted", &self.encrypted)
            .field("expires_at", &self.expires_at)
            .field("tags", &self.tags)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
