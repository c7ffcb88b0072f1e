//! In-Process Connections
//!
//! Connections that execute commands directly against a shared
//! [`StorageEngine`]. Every connection opened by the same
//! [`MemoryConnector`] sees the same keys and channels, so several queues
//! built on one connector coordinate exactly like several workers sharing one
//! Redis server.
//!
//! The first connection opened inside a Tokio runtime starts an
//! [`ExpirySweeper`] for the engine. It runs until the connector and every
//! connection it opened are dropped.

use crate::connection::{
    ttl_millis, Connection, Connector, StoreError, Subscription, SUBSCRIPTION_BUFFER,
};
use crate::storage::{start_expiry_sweeper, ExpirySweeper, StorageEngine};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

const OPEN: u8 = 0;
const SUBSCRIBED: u8 = 1;
const CLOSED: u8 = 2;

/// Opens [`MemoryConnection`]s to one shared engine.
///
/// # Example
///
/// ```
/// use flashmq::connection::{Connector, MemoryConnector};
/// use bytes::Bytes;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let connector = MemoryConnector::new();
/// let a = connector.connect().await.unwrap();
/// let b = connector.connect().await.unwrap();
///
/// a.set(b"greeting", Bytes::from("hello"), None).await.unwrap();
/// assert_eq!(b.get(b"greeting").await.unwrap(), Some(Bytes::from("hello")));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    engine: Arc<StorageEngine>,
    next_id: Arc<AtomicU64>,
    sweeper: Arc<OnceLock<Arc<ExpirySweeper>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Creates a connector over a fresh engine.
    pub fn new() -> Self {
        Self::with_engine(Arc::new(StorageEngine::new()))
    }

    /// Creates a connector over an existing engine.
    pub fn with_engine(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            next_id: Arc::new(AtomicU64::new(1)),
            sweeper: Arc::new(OnceLock::new()),
        }
    }

    /// The engine behind every connection of this connector.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Returns true once the expiry sweeper has been started.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.get().is_some()
    }

    /// Opens a connection without going through the trait object.
    pub fn open(&self) -> MemoryConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(connection = id, "Opened in-process connection");
        MemoryConnection {
            id,
            engine: Arc::clone(&self.engine),
            state: AtomicU8::new(OPEN),
            forwarder: Mutex::new(None),
            _sweeper: self.sweeper(),
        }
    }

    fn sweeper(&self) -> Option<Arc<ExpirySweeper>> {
        if let Some(sweeper) = self.sweeper.get() {
            return Some(Arc::clone(sweeper));
        }
        // Outside a runtime there is nothing to spawn on; lazy expiry still applies
        if Handle::try_current().is_err() {
            debug!("No Tokio runtime, expiry sweeper not started");
            return None;
        }
        let sweeper = self
            .sweeper
            .get_or_init(|| Arc::new(start_expiry_sweeper(Arc::clone(&self.engine))));
        Some(Arc::clone(sweeper))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError> {
        Ok(Arc::new(self.open()))
    }
}

/// A connection to an in-process [`StorageEngine`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    engine: Arc<StorageEngine>,
    state: AtomicU8,
    forwarder: Mutex<Option<AbortHandle>>,
    _sweeper: Option<Arc<ExpirySweeper>>,
}

impl MemoryConnection {
    fn ready(&self) -> Result<&StorageEngine, StoreError> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(&self.engine),
            SUBSCRIBED => Err(StoreError::Subscribed),
            _ => Err(StoreError::Closed),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.ready()?.get(key))
    }

    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let ttl = ttl.map(|ttl| Duration::from_millis(ttl_millis(ttl)));
        self.ready()?.set(Bytes::copy_from_slice(key), value, ttl);
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let ttl = ttl.map(|ttl| Duration::from_millis(ttl_millis(ttl)));
        Ok(self.ready()?.set_nx(Bytes::copy_from_slice(key), value, ttl))
    }

    async fn del(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.ready()?.delete(key))
    }

    async fn zadd(&self, key: &[u8], score: f64, member: Bytes) -> Result<bool, StoreError> {
        self.ready()?
            .zadd(Bytes::copy_from_slice(key), score, member)
            .map_err(|e| StoreError::Server(e.to_string()))
    }

    async fn zrange_by_score(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
    ) -> Result<Vec<Bytes>, StoreError> {
        self.ready()?
            .zrange_by_score(key, min, max)
            .map_err(|e| StoreError::Server(e.to_string()))
    }

    async fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        Ok(self.ready()?.zrem(key, member))
    }

    async fn publish(&self, channel: &[u8], message: Bytes) -> Result<u64, StoreError> {
        Ok(self.ready()?.publish(channel, message) as u64)
    }

    async fn subscribe(&self, channel: &[u8]) -> Result<Subscription, StoreError> {
        self.ready()?;
        if let Err(state) =
            self.state
                .compare_exchange(OPEN, SUBSCRIBED, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if state == SUBSCRIBED {
                StoreError::Subscribed
            } else {
                StoreError::Closed
            });
        }

        let channel = Bytes::copy_from_slice(channel);
        let mut source = self.engine.subscribe(channel.clone());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let connection = self.id;

        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(connection, skipped, "Subscriber fell behind, messages skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!(connection, "Subscription forwarder finished");
        });

        *self.forwarder.lock().unwrap() = Some(forwarder.abort_handle());
        debug!(connection, channel = ?channel, "Subscribed");
        Ok(Subscription::new(channel, rx, forwarder))
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
                forwarder.abort();
            }
            trace!(connection = self.id, "Closed in-process connection");
        }
        Ok(())
    }
}
