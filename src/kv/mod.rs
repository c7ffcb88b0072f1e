//! Key-Value Store
//!
//! A namespaced get/set/delete store over a backing [`Connection`]. Values
//! pass through a [`Codec`] on the way in and out, and every operation is a
//! single round trip.
//!
//! ## Key Layout
//!
//! A [`KvKey`] is a list of string segments. Each `:` inside a segment is
//! escaped as `_:`, the segments are joined with `::`, and the store-wide
//! prefix is put in front:
//!
//! ```text
//!   ["activity", "https://example.com/1"]
//!     ──▶ fedify::activity::https_://example.com/1
//! ```
//!
//! Content can never produce the `::` delimiter on its own, so two different
//! keys never land on the same physical key. Stores with different prefixes
//! never see each other's entries.

use crate::codec::{Codec, CodecError, JsonCodec};
use crate::connection::{Connection, StoreError};
use crate::DEFAULT_KEY_PREFIX;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Errors raised by key-value operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The value could not be encoded, or the stored payload decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The backing store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A key needs at least one segment
    #[error("key has no segments")]
    EmptyKey,
}

/// A structured key: an ordered list of string segments.
///
/// # Example
///
/// ```
/// use flashmq::kv::KvKey;
///
/// let key = KvKey::from(["actor", "alice"]);
/// assert_eq!(key.segments(), ["actor", "alice"]);
/// assert_eq!(key.to_string(), "actor::alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvKey(Vec<String>);

impl KvKey {
    /// Creates a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KvKey(segments.into_iter().map(Into::into).collect())
    }

    /// The segments of this key, in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns true if the key has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds the physical key: `prefix` followed by the escaped segments
    /// joined with `::`.
    pub fn serialize(&self, prefix: &[u8]) -> Result<Bytes, KvError> {
        if self.0.is_empty() {
            return Err(KvError::EmptyKey);
        }

        let suffix_len: usize = self.0.iter().map(|s| s.len() + 2).sum();
        let mut buf = BytesMut::with_capacity(prefix.len() + suffix_len * 2);
        buf.put_slice(prefix);
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                buf.put_slice(b"::");
            }
            for &byte in segment.as_bytes() {
                if byte == b':' {
                    buf.put_u8(b'_');
                }
                buf.put_u8(byte);
            }
        }
        Ok(buf.freeze())
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("::"))
    }
}

impl From<&str> for KvKey {
    fn from(segment: &str) -> Self {
        KvKey(vec![segment.to_string()])
    }
}

impl From<Vec<String>> for KvKey {
    fn from(segments: Vec<String>) -> Self {
        KvKey(segments)
    }
}

impl From<&[&str]> for KvKey {
    fn from(segments: &[&str]) -> Self {
        KvKey::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for KvKey {
    fn from(segments: [&str; N]) -> Self {
        KvKey::new(segments)
    }
}

/// The storage capability: typed get/set/delete by structured key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a value. Missing and expired keys give `Ok(None)`.
    async fn get<T>(&self, key: &KvKey) -> Result<Option<T>, KvError>
    where
        T: DeserializeOwned + Send;

    /// Writes a value. With a TTL the entry expires on its own once the
    /// duration has elapsed.
    async fn set<T>(&self, key: &KvKey, value: &T, ttl: Option<Duration>) -> Result<(), KvError>
    where
        T: Serialize + Sync + ?Sized;

    /// Deletes a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &KvKey) -> Result<(), KvError>;
}

/// Options for [`RedisKvStore`].
#[derive(Debug, Clone)]
pub struct KvStoreOptions<C = JsonCodec> {
    /// Prepended to every physical key (default: `fedify::`)
    pub key_prefix: Bytes,

    /// Value codec (default: [`JsonCodec`])
    pub codec: C,
}

impl Default for KvStoreOptions<JsonCodec> {
    fn default() -> Self {
        Self {
            key_prefix: Bytes::from_static(DEFAULT_KEY_PREFIX.as_bytes()),
            codec: JsonCodec::new(),
        }
    }
}

impl<C: Codec> KvStoreOptions<C> {
    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Replaces the codec.
    pub fn with_codec<D: Codec>(self, codec: D) -> KvStoreOptions<D> {
        KvStoreOptions {
            key_prefix: self.key_prefix,
            codec,
        }
    }
}

/// A key-value store over a Redis-shaped [`Connection`].
///
/// # Example
///
/// ```
/// use flashmq::connection::{Connector, MemoryConnector};
/// use flashmq::kv::{KvKey, KvStore, RedisKvStore};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), flashmq::kv::KvError> {
/// let connector = MemoryConnector::new();
/// let store = RedisKvStore::new(connector.connect().await?);
///
/// let key = KvKey::from(["session", "42"]);
/// store.set(&key, "alice", Some(Duration::from_secs(60))).await?;
/// assert_eq!(store.get::<String>(&key).await?.as_deref(), Some("alice"));
///
/// store.delete(&key).await?;
/// assert_eq!(store.get::<String>(&key).await?, None);
/// # Ok(())
/// # }
/// ```
pub struct RedisKvStore<C = JsonCodec> {
    conn: Arc<dyn Connection>,
    key_prefix: Bytes,
    codec: C,
}

impl RedisKvStore<JsonCodec> {
    /// Creates a store with the default prefix and codec.
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self::with_options(conn, KvStoreOptions::default())
    }
}

impl<C: Codec> RedisKvStore<C> {
    /// Creates a store with explicit options.
    pub fn with_options(conn: Arc<dyn Connection>, options: KvStoreOptions<C>) -> Self {
        Self {
            conn,
            key_prefix: options.key_prefix,
            codec: options.codec,
        }
    }

    /// The prefix in front of every physical key.
    pub fn key_prefix(&self) -> &[u8] {
        &self.key_prefix
    }

    /// The physical key a logical key is stored under.
    pub fn physical_key(&self, key: &KvKey) -> Result<Bytes, KvError> {
        key.serialize(&self.key_prefix)
    }
}

impl<C> fmt::Debug for RedisKvStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKvStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: Codec> KvStore for RedisKvStore<C> {
    async fn get<T>(&self, key: &KvKey) -> Result<Option<T>, KvError>
    where
        T: DeserializeOwned + Send,
    {
        let physical = self.physical_key(key)?;
        match self.conn.get(&physical).await? {
            Some(encoded) => Ok(Some(self.codec.decode(&encoded)?)),
            None => {
                trace!(key = %key, "Key not found");
                Ok(None)
            }
        }
    }

    async fn set<T>(&self, key: &KvKey, value: &T, ttl: Option<Duration>) -> Result<(), KvError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let physical = self.physical_key(key)?;
        let encoded = self.codec.encode(value)?;
        trace!(
            key = %key,
            bytes = encoded.len(),
            ttl_ms = ttl.map(|t| t.as_millis() as u64),
            "Storing value"
        );
        self.conn.set(&physical, encoded, ttl).await?;
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        let physical = self.physical_key(key)?;
        self.conn.del(&physical).await?;
        Ok(())
    }
}
