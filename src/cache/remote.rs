//! Remote Tier - shared external key-value store
//!
//! The remote tier holds codec-encoded bytes with store-native expiry, plus
//! one set per tag listing the member keys. Two stores are provided:
//!
//! - [`RedisRemoteStore`]: production store over a multiplexed
//!   `ConnectionManager`; tag registration and invalidation are Lua scripts,
//!   so each is one atomic round-trip
//! - [`InMemoryRemoteStore`]: `DashMap`-backed store for tests and
//!   single-process deployments, with an availability switch for simulating
//!   outages
//!
//! [`RemoteTier`] wraps a store with the configured key prefix so callers
//! deal only in logical keys. Under the prefix, data keys and tag sets live in
//! disjoint segments, so no logical key can address a tag set:
//!
//! ```text
//! <prefix>k:<logical key>     encoded value
//! <prefix>tag:<tag name>      set of member data keys
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::clock::Clock;
use super::pattern::KeyPattern;
use crate::config::RemoteConfig;
use crate::error::{Error, Result};

/// Segment between the key prefix and a tag name
pub const TAG_SEGMENT: &str = "tag:";

/// Segment between the key prefix and a logical data key
pub const DATA_SEGMENT: &str = "k:";

/// Keys deleted per round-trip during pattern deletes
const DELETE_BATCH: usize = 500;

/// A value read from the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub data: Bytes,
    /// Time left before the store expires the key (`None` = no expiry)
    pub ttl: Option<Duration>,
}

/// Approximate store occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub key_count: u64,
    pub memory_bytes: u64,
}

// =============================================================================
// Remote Store Trait
// =============================================================================

/// Remote key-value store port. Keys here are physical (already prefixed).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store name for logs
    fn name(&self) -> &'static str;

    /// Read a value and its remaining TTL
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>>;

    /// Write a value; `None` stores it without expiry
    async fn set(&self, key: &str, data: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Whether a live key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add members to a tag set. The set's expiry only ever grows: it is
    /// raised to `ttl` when shorter, and `None` makes the set persistent.
    async fn tag_add(&self, tag_key: &str, members: &[String], ttl: Option<Duration>) -> Result<()>;

    /// Delete every member of a tag set and then the set itself, in one
    /// round-trip. Returns the members that actually existed.
    async fn tag_invalidate(&self, tag_key: &str) -> Result<Vec<String>>;

    /// Enumerate keys matching a glob
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Approximate occupancy
    async fn info(&self) -> Result<RemoteInfo>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Release the connection; later calls report `RemoteUnavailable`
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Redis Store
// =============================================================================

const TAG_ADD_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
for i = 2, #ARGV do
  redis.call('SADD', KEYS[1], ARGV[i])
end
local ttl = tonumber(ARGV[1])
if ttl <= 0 then
  redis.call('PERSIST', KEYS[1])
  return -1
end
local current = redis.call('TTL', KEYS[1])
if existed == 0 or (current >= 0 and current < ttl) then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return ttl
"#;

const TAG_INVALIDATE_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
local deleted = {}
for _, member in ipairs(members) do
  if redis.call('DEL', member) == 1 then
    table.insert(deleted, member)
  end
end
redis.call('DEL', KEYS[1])
return deleted
"#;

/// Whole seconds for `EXPIRE`, rounded up so a tag set never expires
/// before a member written with the same TTL
fn expire_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

/// Redis-backed remote store
pub struct RedisRemoteStore {
    connection: ConnectionManager,
    timeout: Duration,
    closed: AtomicBool,
    tag_add: redis::Script,
    tag_invalidate: redis::Script,
}

impl RedisRemoteStore {
    /// Connect to `endpoint` (a `redis://` URL)
    pub async fn connect(endpoint: &str, config: &RemoteConfig) -> Result<Self> {
        let client = redis::Client::open(endpoint)
            .map_err(|e| Error::Config(format!("invalid remote endpoint '{endpoint}': {e}")))?;

        let timeout = config.operation_timeout();
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::RemoteUnavailable(format!("connect to {endpoint} timed out")))??;

        info!(endpoint = %endpoint, "Connected to remote store");

        Ok(Self {
            connection,
            timeout,
            closed: AtomicBool::new(false),
            tag_add: redis::Script::new(TAG_ADD_SCRIPT),
            tag_invalidate: redis::Script::new(TAG_INVALIDATE_SCRIPT),
        })
    }

    /// Clone the multiplexed connection, refusing once closed
    fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::RemoteUnavailable("remote store is disconnected".into()));
        }
        Ok(self.connection.clone())
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::RemoteUnavailable(format!(
                "{op} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>> {
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);

        let (data, pttl): (Option<Vec<u8>>, i64) =
            self.bounded("GET", pipe.query_async(&mut conn)).await?;

        Ok(data.map(|data| RemoteValue {
            data: Bytes::from(data),
            ttl: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(data.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }

        let _: () = self.bounded("SET", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let deleted: u64 = self
            .bounded("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await?;
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let exists: bool = self
            .bounded("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await?;
        Ok(exists)
    }

    async fn tag_add(&self, tag_key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut invocation = self.tag_add.key(tag_key);
        invocation.arg(ttl.map_or(0, expire_secs));
        for member in members {
            invocation.arg(member);
        }

        let _: i64 = self
            .bounded("tag add", invocation.invoke_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn tag_invalidate(&self, tag_key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let invocation = self.tag_invalidate.key(tag_key);
        let deleted: Vec<String> = self
            .bounded("tag invalidate", invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(DELETE_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn info(&self) -> Result<RemoteInfo> {
        let mut conn = self.conn()?;
        let key_count: u64 = self
            .bounded("DBSIZE", redis::cmd("DBSIZE").query_async(&mut conn))
            .await?;
        let memory: String = self
            .bounded("INFO", redis::cmd("INFO").arg("memory").query_async(&mut conn))
            .await?;

        let memory_bytes = memory
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);

        Ok(RemoteInfo {
            key_count,
            memory_bytes,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        info!("Remote store connection closed");
        Ok(())
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

struct StoredValue {
    data: Bytes,
    expires_at: Option<DateTime<Utc>>,
}

struct StoredSet {
    members: HashSet<String>,
    expires_at: Option<DateTime<Utc>>,
}

fn live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| now < at)
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// In-process remote store.
/// Uses DashMap for concurrent access; expiry is read through the shared clock.
pub struct InMemoryRemoteStore {
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, StoredSet>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<DateTime<Utc>> {
        if !self.is_available() {
            return Err(Error::RemoteUnavailable("in-memory store is offline".into()));
        }
        Ok(self.clock.now())
    }

    /// Remove a key if it is live, reporting whether it was
    fn take_live(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.values
            .remove(key)
            .is_some_and(|(_, value)| live(value.expires_at, now))
    }

    /// Expiry of a tag set, if it exists and is live (`Some(None)` = persistent)
    pub fn tag_expiry(&self, tag_key: &str) -> Option<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        self.sets
            .get(tag_key)
            .filter(|set| live(set.expires_at, now))
            .map(|set| set.expires_at)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>> {
        let now = self.check()?;
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        if !live(value.expires_at, now) {
            drop(value);
            self.values.remove(key);
            return Ok(None);
        }

        Ok(Some(RemoteValue {
            data: value.data.clone(),
            ttl: value
                .expires_at
                .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)),
        }))
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Option<Duration>) -> Result<()> {
        let now = self.check()?;
        self.values.insert(
            key.to_string(),
            StoredValue {
                data,
                expires_at: ttl.and_then(|ttl| deadline(now, ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = self.check()?;
        let mut deleted = 0;
        for key in keys {
            if self.take_live(key, now) {
                deleted += 1;
            }
            if self.sets.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.check()?;
        Ok(self
            .values
            .get(key)
            .is_some_and(|value| live(value.expires_at, now)))
    }

    async fn tag_add(&self, tag_key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let now = self.check()?;
        if members.is_empty() {
            return Ok(());
        }
        let requested = ttl.and_then(|ttl| deadline(now, ttl));

        let mut set = self
            .sets
            .entry(tag_key.to_string())
            .or_insert_with(|| StoredSet {
                members: HashSet::new(),
                expires_at: requested,
            });

        if !live(set.expires_at, now) {
            set.members.clear();
            set.expires_at = requested;
        }
        set.members.extend(members.iter().cloned());
        set.expires_at = match (set.expires_at, requested) {
            (Some(current), Some(new)) => Some(current.max(new)),
            _ => None,
        };
        Ok(())
    }

    async fn tag_invalidate(&self, tag_key: &str) -> Result<Vec<String>> {
        let now = self.check()?;
        let Some((_, set)) = self.sets.remove(tag_key) else {
            return Ok(Vec::new());
        };
        if !live(set.expires_at, now) {
            return Ok(Vec::new());
        }

        let mut deleted: Vec<String> = set
            .members
            .into_iter()
            .filter(|member| self.take_live(member, now))
            .collect();
        deleted.sort_unstable();
        Ok(deleted)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = self.check()?;
        let pattern = KeyPattern::new(pattern)?;

        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|item| live(item.expires_at, now) && pattern.matches(item.key()))
            .map(|item| item.key().clone())
            .chain(
                self.sets
                    .iter()
                    .filter(|item| live(item.expires_at, now) && pattern.matches(item.key()))
                    .map(|item| item.key().clone()),
            )
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn info(&self) -> Result<RemoteInfo> {
        let now = self.check()?;
        let mut info = RemoteInfo::default();
        for item in self.values.iter().filter(|item| live(item.expires_at, now)) {
            info.key_count += 1;
            info.memory_bytes += (item.key().len() + item.data.len()) as u64;
        }
        Ok(info)
    }

    async fn ping(&self) -> Result<()> {
        self.check().map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.set_available(false);
        Ok(())
    }
}

// =============================================================================
// Remote Tier
// =============================================================================

/// Prefix-aware view over a [`RemoteStore`]
pub struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    prefix: String,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn RemoteStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    fn data_prefix(&self) -> String {
        format!("{}{}", self.prefix, DATA_SEGMENT)
    }

    fn physical(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, DATA_SEGMENT, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}{}", self.prefix, TAG_SEGMENT, tag)
    }

    fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        physical
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(DATA_SEGMENT)
    }

    pub async fn get(&self, key: &str) -> Result<Option<RemoteValue>> {
        self.store.get(&self.physical(key)).await
    }

    pub async fn set(&self, key: &str, data: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.store.set(&self.physical(key), data, ttl).await
    }

    /// Delete one key; true if it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.store.delete(&[self.physical(key)]).await? > 0)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.physical(key)).await
    }

    /// Register `key` under each tag
    pub async fn register_tags<'a, I>(&self, key: &str, tags: I, ttl: Option<Duration>) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let member = [self.physical(key)];
        for tag in tags {
            self.store.tag_add(&self.tag_key(tag), &member, ttl).await?;
        }
        Ok(())
    }

    /// Invalidate one tag, returning the logical keys that were deleted
    pub async fn invalidate_tag(&self, tag: &str) -> Result<Vec<String>> {
        let deleted = self.store.tag_invalidate(&self.tag_key(tag)).await?;
        Ok(deleted
            .iter()
            .filter_map(|physical| self.logical(physical).map(str::to_string))
            .collect())
    }

    /// Delete data keys matching a logical glob; tag sets are left alone.
    /// Returns the logical keys that were found and deleted.
    pub async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let glob = format!("{}{}", KeyPattern::escape_literal(&self.data_prefix()), pattern.as_glob());
        let keys = self.store.scan(&glob).await?;

        self.delete_batched(&keys).await?;
        Ok(self.logical_keys(&keys))
    }

    /// Delete everything under the prefix, tag sets included.
    /// Returns the logical data keys deleted.
    pub async fn clear_all(&self) -> Result<Vec<String>> {
        let glob = format!("{}*", KeyPattern::escape_literal(&self.prefix));
        let keys = self.store.scan(&glob).await?;
        self.delete_batched(&keys).await?;
        Ok(self.logical_keys(&keys))
    }

    fn logical_keys(&self, physical: &[String]) -> Vec<String> {
        physical
            .iter()
            .filter_map(|key| self.logical(key).map(str::to_string))
            .collect()
    }

    async fn delete_batched(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            deleted += self.store.delete(batch).await?;
        }
        debug!(store = self.store.name(), deleted, "Remote keys deleted");
        Ok(deleted)
    }

    pub async fn info(&self) -> Result<RemoteInfo> {
        self.store.info().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

// =============================================================================
// Tests
// =============================================================================
