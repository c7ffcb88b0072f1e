//! # FlashMQ - Delayed Message Queue and Key-Value Store over Redis Primitives
//!
//! FlashMQ gives a message-dispatch framework two capabilities backed by a
//! shared Redis-like store:
//!
//! - a **message queue** with immediate and delayed delivery, shared safely by
//!   any number of worker processes
//! - a **key-value store** with namespaced structured keys and expiry
//!
//! Both encode values through a pluggable [`Codec`](codec::Codec).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                FlashMQ                                  │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐     │
//! │  │ RedisMessageQueue│   │   RedisKvStore   │   │      Codec       │     │
//! │  │ lease + listener │   │  KvKey escaping  │   │ JsonCodec / ...  │     │
//! │  └────────┬─────────┘   └────────┬─────────┘   └──────────────────┘     │
//! │           │                      │                                      │
//! │           ▼                      ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │        Connection: GET SET DEL ZADD ZRANGEBYSCORE ZREM PUB/SUB   │   │
//! │  └────────┬───────────────────────────────────────────┬─────────────┘   │
//! │           │                                           │                 │
//! │           ▼                                           ▼                 │
//! │  ┌──────────────────────────────┐     ┌────────────────────────────┐    │
//! │  │ MemoryConnection             │     │ RespConnection             │    │
//! │  │  └▶ StorageEngine (sharded)  │     │  └▶ RESP2 over TCP         │    │
//! │  │      + ExpirySweeper         │     │      to a Redis server     │    │
//! │  └──────────────────────────────┘     └────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use flashmq::connection::{Connector, MemoryConnector};
//! use flashmq::kv::{KvKey, KvStore, RedisKvStore};
//! use flashmq::queue::{EnqueueOptions, MessageQueue, QueueOptions, RedisMessageQueue};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! // Swap in `TcpConnector::new("127.0.0.1:6379")` to use a Redis server
//! let connector = MemoryConnector::new();
//!
//! let kv = RedisKvStore::new(connector.connect().await?);
//! kv.set(&KvKey::from(["cache", "actor"]), "alice", Some(Duration::from_secs(60)))
//!     .await?;
//!
//! let queue = RedisMessageQueue::connect(&connector, QueueOptions::default()).await?;
//! queue
//!     .listen(|activity: String| async move {
//!         println!("delivering {}", activity);
//!         anyhow::Ok(())
//!     })
//!     .await?;
//!
//! queue.enqueue("Follow", EnqueueOptions::immediate()).await?;
//! queue
//!     .enqueue("Undo", EnqueueOptions::delayed(Duration::from_secs(30)))
//!     .await?;
//!
//! queue.dispose().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`codec`]: the `Codec` trait and the default JSON codec
//! - [`kv`]: structured keys and the key-value store
//! - [`queue`]: the delayed message queue, its lease and listener
//! - [`connection`]: the Redis-shaped command set and its two backends
//! - [`protocol`]: RESP types and the incremental reply parser
//! - [`storage`]: the in-process storage engine with TTL and pub/sub
//!
//! ## Delivery Guarantees
//!
//! A message is removed from the store by exactly one worker under normal
//! operation, then handed to the handler. Removal happens first: a worker
//! that dies after removing a message loses it. A worker that dies while
//! holding the lease blocks draining until the lease expires, after twice the
//! polling interval.

pub mod codec;
pub mod connection;
pub mod kv;
pub mod protocol;
pub mod queue;
pub mod storage;

// Re-export commonly used types for convenience
pub use codec::{Codec, CodecError, JsonCodec};
pub use connection::{Connection, Connector, MemoryConnector, StoreError, TcpConnector};
pub use kv::{KvError, KvKey, KvStore, KvStoreOptions, RedisKvStore};
pub use queue::{
    EnqueueOptions, MessageHandler, MessageQueue, QueueError, QueueOptions, RedisMessageQueue,
};
pub use storage::StorageEngine;

use std::time::Duration;

/// Default pub/sub channel for queue wake-up notifications
pub const DEFAULT_CHANNEL_KEY: &str = "fedify_channel";

/// Default sorted set holding queued messages
pub const DEFAULT_QUEUE_KEY: &str = "fedify_queue";

/// Default lease key
pub const DEFAULT_LOCK_KEY: &str = "fedify_lock";

/// Default prefix for key-value store keys
pub const DEFAULT_KEY_PREFIX: &str = "fedify::";

/// Default interval between fallback polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Version of FlashMQ
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
