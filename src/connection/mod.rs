//! Backing Store Connections
//!
//! The key-value store and the message queue never talk to a storage engine
//! directly. They go through a [`Connection`]: a narrow, Redis-shaped command
//! set that any backing store able to provide these primitives can implement.
//!
//! | Primitive              | Redis command                 |
//! |------------------------|-------------------------------|
//! | `get`                  | `GET key`                     |
//! | `set`                  | `SET key value [PX ms]`       |
//! | `set_nx`               | `SET key value NX [PX ms]`    |
//! | `del`                  | `DEL key`                     |
//! | `zadd`                 | `ZADD key score member`       |
//! | `zrange_by_score`      | `ZRANGEBYSCORE key min max`   |
//! | `zrem`                 | `ZREM key member`             |
//! | `publish`              | `PUBLISH channel message`     |
//! | `subscribe`            | `SUBSCRIBE channel`           |
//!
//! Like a Redis client connection, a connection that has subscribed to a
//! channel is dedicated to that subscription and refuses further commands.
//! That is why the queue opens two connections through a [`Connector`].
//!
//! ## Implementations
//!
//! - [`MemoryConnector`]: connections to a shared in-process
//!   [`StorageEngine`](crate::storage::StorageEngine)
//! - [`TcpConnector`] / [`RespConnection`]: RESP over a byte stream to a
//!   Redis-compatible server

pub mod memory;
pub mod resp;

pub use memory::{MemoryConnection, MemoryConnector};
pub use resp::{RespConnection, TcpConnector};

use crate::protocol::ParseError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors raised by a backing store connection.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent bytes that are not valid RESP
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The store rejected the command
    #[error("server error: {0}")]
    Server(String),

    /// The reply had a shape the command never produces
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    /// The connection was closed
    #[error("connection closed")]
    Closed,

    /// The connection is dedicated to a subscription
    #[error("connection is in subscriber mode")]
    Subscribed,
}

/// A connection to a backing store.
///
/// Every method is one round trip. Failures are returned unchanged; there is
/// no retry at this layer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Reads a string value. Missing and expired keys give `None`.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Writes a string value. With a TTL, value and expiry are written by a
    /// single atomic command.
    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Writes a string value only if the key is absent. Returns whether the
    /// write happened.
    async fn set_nx(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Deletes a key. Returns whether it existed.
    async fn del(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Adds or re-scores a sorted set member. Returns whether it was new.
    async fn zadd(&self, key: &[u8], score: f64, member: Bytes) -> Result<bool, StoreError>;

    /// Returns sorted set members with `min <= score <= max`, lowest first.
    async fn zrange_by_score(&self, key: &[u8], min: f64, max: f64)
        -> Result<Vec<Bytes>, StoreError>;

    /// Removes a sorted set member. Returns whether it was present.
    async fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError>;

    /// Publishes a message. Returns how many subscribers received it.
    async fn publish(&self, channel: &[u8], message: Bytes) -> Result<u64, StoreError>;

    /// Subscribes to a channel. The connection accepts no further commands.
    async fn subscribe(&self, channel: &[u8]) -> Result<Subscription, StoreError>;

    /// Closes the connection and ends any subscription it carries.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Opens connections to a backing store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new, independent connection.
    async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError>;
}

/// Messages arriving on a subscribed channel.
///
/// A background task forwards messages from the connection into this
/// handle; dropping the handle stops the task.
#[derive(Debug)]
pub struct Subscription {
    channel: Bytes,
    rx: mpsc::Receiver<Bytes>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    /// Wraps a forwarding task and the receiving end of its channel.
    pub fn new(channel: Bytes, rx: mpsc::Receiver<Bytes>, forwarder: JoinHandle<()>) -> Self {
        Self {
            channel,
            rx,
            forwarder,
        }
    }

    /// The channel this subscription listens on.
    pub fn channel(&self) -> &[u8] {
        &self.channel
    }

    /// Waits for the next message. Returns `None` once the subscription has
    /// ended (connection closed or lost).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Capacity of the buffer between a forwarding task and its [`Subscription`].
pub(crate) const SUBSCRIPTION_BUFFER: usize = 64;

/// Converts a TTL into whole milliseconds, rounding sub-millisecond values up.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
