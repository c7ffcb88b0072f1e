//! Thread-Safe In-Process Storage Engine
//!
//! This module implements the subset of Redis a delayed message queue needs,
//! entirely in memory:
//!
//! - **Strings** with optional expiry (`GET`, `SET [NX] [PX]`, `DEL`, `PEXPIRE`)
//! - **Sorted sets** ordered by a floating point score (`ZADD`, `ZRANGEBYSCORE`, `ZREM`)
//! - **Pub/Sub** channels (`PUBLISH`, `SUBSCRIBE`)
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Keys are spread over 64 shards, each with its own locks.
//! 2. **Atomic Conditional Writes**: `set_nx` checks and writes under one shard
//!    write lock, so concurrent callers can never both win.
//! 3. **Lazy Expiry**: Expired strings are dropped on access; the
//!    [`ExpirySweeper`](crate::storage::ExpirySweeper) reclaims the rest.
//! 4. **One Keyspace**: Strings and sorted sets share key names. `SET` replaces
//!    a sorted set, `ZADD` refuses a key holding a string.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ strings │ │ strings │ │ strings │ │ strings │           │
//! │  │ zsets   │ │ zsets   │ │ zsets   │ │ zsets   │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │  ┌───────────────────────────────────────────────┐         │
//! │  │ channels: name -> broadcast::Sender<Bytes>     │         │
//! │  └───────────────────────────────────────────────┘         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Within a shard the string lock is always taken before the sorted set lock.

use bytes::Bytes;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Messages buffered per pub/sub channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 1024;

/// Error returned when a sorted set command hits a string key.
pub const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// A stored string with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Creates a new entry with TTL.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }

    /// Returns the remaining TTL in milliseconds, or None if no expiry.
    pub fn ttl_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}

/// A sorted set score, totally ordered so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// A set of unique members ordered by score, then by member bytes.
#[derive(Debug, Default, Clone)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    ordered: BTreeSet<(Score, Bytes)>,
}

impl SortedSet {
    /// Creates an empty sorted set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a member or moves an existing one to a new score.
    ///
    /// Returns `true` if the member was not present before.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                self.ordered.insert((Score(score), member));
                false
            }
            None => {
                self.ordered.insert((Score(score), member));
                true
            }
        }
    }

    /// Removes a member. Returns `true` if it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered
                    .remove(&(Score(score), Bytes::copy_from_slice(member)));
                true
            }
            None => false,
        }
    }

    /// Returns the score of a member.
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Returns members with `min <= score <= max` in ascending order.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<Bytes> {
        self.ordered
            .range((Score(min), Bytes::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .map(|(_, member)| member.clone())
            .collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// A single shard containing a portion of the keyspace.
#[derive(Debug)]
struct Shard {
    strings: RwLock<HashMap<Bytes, Entry>>,
    zsets: RwLock<HashMap<Bytes, SortedSet>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            strings: RwLock::new(HashMap::new()),
            zsets: RwLock::new(HashMap::new()),
        }
    }
}

/// The in-process backing store.
///
/// Wrap it in an `Arc` and share it; every operation takes `&self` and is
/// safe to call from any task or thread.
///
/// # Example
///
/// ```
/// use flashmq::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// // Only the first writer wins
/// let ttl = Some(Duration::from_secs(10));
/// assert!(engine.set_nx(Bytes::from("lock"), Bytes::from("worker-1"), ttl));
/// assert!(!engine.set_nx(Bytes::from("lock"), Bytes::from("worker-2"), ttl));
///
/// // Sorted sets come back in score order
/// engine.zadd(Bytes::from("queue"), 20.0, Bytes::from("later")).unwrap();
/// engine.zadd(Bytes::from("queue"), 0.0, Bytes::from("now")).unwrap();
/// assert_eq!(
///     engine.zrange_by_score(b"queue", 0.0, 10.0).unwrap(),
///     vec![Bytes::from("now")]
/// );
/// ```
pub struct StorageEngine {
    /// Sharded storage for reduced lock contention
    shards: Vec<Shard>,

    /// Pub/sub channels by name
    channels: RwLock<HashMap<Bytes, broadcast::Sender<Bytes>>>,

    /// Statistics: number of live keys of any type (approximate)
    key_count: AtomicU64,

    /// Statistics: total read operations
    get_count: AtomicU64,

    /// Statistics: total write operations
    set_count: AtomicU64,

    /// Statistics: total DEL/ZREM operations
    del_count: AtomicU64,

    /// Statistics: number of expired keys cleaned up
    expired_count: AtomicU64,

    /// Statistics: messages published
    publish_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
    pub published: u64,
}

impl StorageEngine {
    /// Creates a new, empty storage engine.
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::new()).collect(),
            channels: RwLock::new(HashMap::new()),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            publish_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn record_expired(&self) {
        self.key_count.fetch_sub(1, Ordering::Relaxed);
        self.expired_count.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Stores a string, replacing any value (of any type) under the key.
    ///
    /// A TTL makes the key expire on its own; the value and its expiry are
    /// written together.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(&key);
        let mut strings = shard.strings.write().unwrap();
        let mut zsets = shard.zsets.write().unwrap();

        let replaced_zset = zsets.remove(&key).is_some();
        let entry = match ttl {
            Some(ttl) => Entry::with_ttl(value, ttl),
            None => Entry::new(value),
        };
        let replaced_string = strings.insert(key, entry).is_some();

        if !replaced_zset && !replaced_string {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stores a string only if the key does not hold a live value.
    ///
    /// The check and the write happen under the same shard lock.
    ///
    /// # Returns
    ///
    /// Returns `true` if the value was written.
    pub fn set_nx(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(&key);
        let mut strings = shard.strings.write().unwrap();
        if shard.zsets.read().unwrap().contains_key(&key) {
            return false;
        }

        let expired = match strings.get(&key) {
            Some(entry) if !entry.is_expired() => return false,
            Some(_) => true,
            None => false,
        };
        if expired {
            // The expired entry is replaced in place below.
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        let entry = match ttl {
            Some(ttl) => Entry::with_ttl(value, ttl),
            None => Entry::new(value),
        };
        strings.insert(key, entry);
        true
    }

    /// Gets the value of a string key.
    ///
    /// Returns `None` if the key doesn't exist, has expired or is not a string.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Gets the full entry for a string key, including its expiry.
    pub fn get_entry(&self, key: &[u8]) -> Option<Entry> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);
        {
            let strings = shard.strings.read().unwrap();
            match strings.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Key exists but is expired - need write lock to remove it
        let mut strings = shard.strings.write().unwrap();
        match strings.get(key) {
            Some(entry) if entry.is_expired() => {
                strings.remove(key);
                self.record_expired();
                None
            }
            // Race: another thread may have replaced the key
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Deletes a key of any type.
    ///
    /// # Returns
    ///
    /// Returns `true` if a live key was deleted.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);
        let mut strings = shard.strings.write().unwrap();
        let mut zsets = shard.zsets.write().unwrap();

        let removed = match strings.remove(key) {
            Some(entry) if entry.is_expired() => {
                self.record_expired();
                false
            }
            Some(_) => true,
            None => zsets.remove(key).is_some(),
        };
        if removed {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Checks if a key of any type exists (and is not expired).
    pub fn exists(&self, key: &[u8]) -> bool {
        let shard = self.shard(key);
        let live_string = shard
            .strings
            .read()
            .unwrap()
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false);
        live_string || shard.zsets.read().unwrap().contains_key(key)
    }

    /// Sets an expiry time on an existing string key.
    ///
    /// # Returns
    ///
    /// Returns `true` if the expiry was set, `false` if the key doesn't exist.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let shard = self.shard(key);
        let mut strings = shard.strings.write().unwrap();

        match strings.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                strings.remove(key);
                self.record_expired();
                false
            }
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Gets the remaining TTL for a string key in milliseconds.
    ///
    /// # Returns
    ///
    /// - `Some(ms)` if the key exists and has an expiry
    /// - `Some(-1)` if the key exists but has no expiry
    /// - `None` if the key doesn't exist
    pub fn pttl(&self, key: &[u8]) -> Option<i64> {
        self.get_entry(key)
            .map(|entry| entry.ttl_ms().map(|ms| ms as i64).unwrap_or(-1))
    }

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    /// Adds a member to a sorted set, or updates its score if present.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if the member is new. Fails for NaN scores and for keys
    /// holding a string.
    pub fn zadd(&self, key: Bytes, score: f64, member: Bytes) -> Result<bool, &'static str> {
        if score.is_nan() {
            return Err("ERR value is not a valid float");
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(&key);
        let mut strings = shard.strings.write().unwrap();
        match strings.get(&key) {
            Some(entry) if !entry.is_expired() => return Err(WRONGTYPE),
            Some(_) => {
                strings.remove(&key);
                self.record_expired();
            }
            None => {}
        }
        let mut zsets = shard.zsets.write().unwrap();

        let set = zsets.entry(key).or_insert_with(|| {
            self.key_count.fetch_add(1, Ordering::Relaxed);
            SortedSet::new()
        });
        Ok(set.insert(member, score))
    }

    /// Returns members of a sorted set with `min <= score <= max`,
    /// lowest score first. Members with equal scores come back in byte order.
    pub fn zrange_by_score(&self, key: &[u8], min: f64, max: f64) -> Result<Vec<Bytes>, &'static str> {
        if min.is_nan() || max.is_nan() {
            return Err("ERR min or max is not a float");
        }
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let zsets = self.shard(key).zsets.read().unwrap();
        Ok(zsets
            .get(key)
            .map(|set| set.range_by_score(min, max))
            .unwrap_or_default())
    }

    /// Removes a member from a sorted set. An emptied set is deleted.
    ///
    /// # Returns
    ///
    /// Returns `true` if the member was present.
    pub fn zrem(&self, key: &[u8], member: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut zsets = self.shard(key).zsets.write().unwrap();
        let Some(set) = zsets.get_mut(key) else {
            return false;
        };

        let removed = set.remove(member);
        if set.is_empty() {
            zsets.remove(key);
            self.key_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Returns the number of members in a sorted set.
    pub fn zcard(&self, key: &[u8]) -> usize {
        self.shard(key)
            .zsets
            .read()
            .unwrap()
            .get(key)
            .map(SortedSet::len)
            .unwrap_or(0)
    }

    /// Returns the score of a sorted set member.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.shard(key)
            .zsets
            .read()
            .unwrap()
            .get(key)
            .and_then(|set| set.score(member))
    }

    // ------------------------------------------------------------------
    // Pub/Sub
    // ------------------------------------------------------------------

    /// Subscribes to a channel, creating it on first use.
    pub fn subscribe(&self, channel: Bytes) -> broadcast::Receiver<Bytes> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publishes a message to every current subscriber of a channel.
    ///
    /// # Returns
    ///
    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, channel: &[u8], message: Bytes) -> usize {
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        let channels = self.channels.read().unwrap();
        channels
            .get(channel)
            .and_then(|tx| tx.send(message).ok())
            .unwrap_or(0)
    }

    /// Returns the number of subscribers on a channel.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels
            .read()
            .unwrap()
            .get(channel)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Number of channels that currently exist.
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    /// Drops channels nobody is subscribed to.
    ///
    /// # Returns
    ///
    /// Returns the number of channels removed.
    pub fn prune_channels(&self) -> usize {
        let mut channels = self.channels.write().unwrap();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Clears every key. Channels and their subscribers are kept.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.strings.write().unwrap().clear();
            shard.zsets.write().unwrap().clear();
        }
        self.key_count.store(0, Ordering::Relaxed);
    }

    /// Returns the approximate number of live keys of any type.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the database is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
            published: self.publish_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired strings from all shards.
    ///
    /// # Returns
    ///
    /// Returns the number of keys that were cleaned up.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut strings = shard.strings.write().unwrap();
            let before = strings.len();
            strings.retain(|_, entry| !entry.is_expired());
            cleaned += (before - strings.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}
