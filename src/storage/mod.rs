//! In-Process Storage Engine
//!
//! A thread-safe store that offers the Redis primitives the queue and the
//! key-value store are built on, so both can run without an external server:
//! strings with expiry and atomic set-if-absent, sorted sets, and pub/sub.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │               pub/sub channels (broadcast)                  │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! Most callers reach the engine through
//! [`MemoryConnector`](crate::connection::MemoryConnector) rather than directly.

pub mod engine;
pub mod expiry;

// Re-export commonly used types
pub use engine::{Entry, SortedSet, StorageEngine, StorageStats, WRONGTYPE};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
