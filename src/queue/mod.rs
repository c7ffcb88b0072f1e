//! Delayed Message Queue
//!
//! Producers enqueue messages, optionally delayed. Any number of worker
//! processes listen on the same keys; each message is handed to exactly one
//! of them under normal operation.
//!
//! ## Store Layout
//!
//! | Key                            | Type       | Role                                |
//! |--------------------------------|------------|-------------------------------------|
//! | queue key (`fedify_queue`)     | sorted set | encoded message, scored by due time |
//! | lock key (`fedify_lock`)       | string     | lease naming the draining worker    |
//! | channel key (`fedify_channel`) | pub/sub    | empty wake-up notification          |
//!
//! Due times are Unix epoch milliseconds. A message due immediately gets
//! score 0, so it sorts ahead of every delayed message.
//!
//! ## Delivery
//!
//! ```text
//!   enqueue ──ZADD──▶ sorted set        poll (per trigger, per worker):
//!      │                                  1. SET lock worker NX PX 2×interval
//!      └─ due now? ──PUBLISH──▶ channel   2. ZRANGEBYSCORE queue 0 now
//!                                         3. ZREM the earliest member
//!                                         4. DEL lock
//!                                         5. decode and hand to the handler
//! ```
//!
//! A poll runs on every tick of the polling interval and on every wake-up
//! notification. Delayed messages are never announced; they are picked up by
//! the first tick after their due time, so they arrive up to one polling
//! interval late.
//!
//! Each poll removes at most one message, and a trigger keeps a worker
//! polling until nothing is due. The lease is released before the
//! handler runs, so it guards the removal and not the handling. A message is
//! removed before it is handled: if the worker dies in between, the message
//! is gone.
//!
//! Identical encoded messages share one sorted-set member. Enqueuing the same
//! payload twice before it is delivered yields a single delivery.
//!
//! ## Lifecycle
//!
//! `Created ──listen──▶ Listening ──dispose──▶ Disposed`. `enqueue` works
//! until the queue is disposed; `listen` works once.

pub mod lease;
pub mod listener;

pub use lease::Lease;
pub use listener::MessageHandler;

use crate::codec::{Codec, CodecError, JsonCodec};
use crate::connection::{Connection, Connector, StoreError};
use crate::{DEFAULT_CHANNEL_KEY, DEFAULT_LOCK_KEY, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_KEY};
use async_trait::async_trait;
use bytes::Bytes;
use listener::Listener;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The message could not be encoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The backing store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `listen` was called on a queue that already has a handler
    #[error("already listening")]
    AlreadyListening,

    /// The queue has been disposed
    #[error("queue has been disposed")]
    Disposed,

    /// The polling interval must be greater than zero
    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,
}

/// Options for a single `enqueue` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Deliver no earlier than this long from now
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Deliver as soon as possible.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Deliver no earlier than `delay` from now.
    pub fn delayed(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// The messaging capability: enqueue messages and listen for them.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Adds a message to the queue.
    async fn enqueue<T>(&self, message: &T, options: EnqueueOptions) -> Result<(), QueueError>
    where
        T: Serialize + Sync + ?Sized;

    /// Starts delivering messages to `handler` in the background. A queue
    /// accepts one handler for its lifetime.
    async fn listen<M, H>(&self, handler: H) -> Result<(), QueueError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>;
}

/// Options for [`RedisMessageQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions<C = JsonCodec> {
    /// Identifies this worker in the lease (default: random UUID v4)
    pub worker_id: String,

    /// Pub/sub channel for wake-up notifications
    pub channel_key: Bytes,

    /// Sorted set holding pending messages
    pub queue_key: Bytes,

    /// Lease key
    pub lock_key: Bytes,

    /// Message codec
    pub codec: C,

    /// Time between fallback polls (default: 5s)
    pub poll_interval: Duration,
}

impl Default for QueueOptions<JsonCodec> {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            channel_key: Bytes::from_static(DEFAULT_CHANNEL_KEY.as_bytes()),
            queue_key: Bytes::from_static(DEFAULT_QUEUE_KEY.as_bytes()),
            lock_key: Bytes::from_static(DEFAULT_LOCK_KEY.as_bytes()),
            codec: JsonCodec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl<C: Codec> QueueOptions<C> {
    /// Sets the identity this worker writes into the lease.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the wake-up channel.
    pub fn with_channel_key(mut self, key: impl Into<Bytes>) -> Self {
        self.channel_key = key.into();
        self
    }

    /// Sets the sorted set holding pending messages.
    pub fn with_queue_key(mut self, key: impl Into<Bytes>) -> Self {
        self.queue_key = key.into();
        self
    }

    /// Sets the lease key.
    pub fn with_lock_key(mut self, key: impl Into<Bytes>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Sets the fallback polling interval. The lease lives twice as long.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the codec.
    pub fn with_codec<D: Codec>(self, codec: D) -> QueueOptions<D> {
        QueueOptions {
            worker_id: self.worker_id,
            channel_key: self.channel_key,
            queue_key: self.queue_key,
            lock_key: self.lock_key,
            codec,
            poll_interval: self.poll_interval,
        }
    }
}

/// State shared between the queue handle and its listener tasks.
pub(crate) struct Inner<C> {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) lease: Lease,
    pub(crate) worker_id: String,
    pub(crate) channel_key: Bytes,
    pub(crate) queue_key: Bytes,
    pub(crate) codec: C,
    pub(crate) poll_interval: Duration,
}

impl<C: Codec> Inner<C> {
    fn lease_ttl(&self) -> Duration {
        self.poll_interval * 2
    }

    /// Takes the earliest due message, if this worker wins the lease.
    pub(crate) async fn poll(&self) -> Result<Option<Bytes>, StoreError> {
        if !self.lease.try_acquire(&self.worker_id, self.lease_ttl()).await? {
            trace!(worker = %self.worker_id, "Lease held by another worker");
            return Ok(None);
        }

        let taken = self.take_due().await;

        if let Err(e) = self.lease.release(&self.worker_id).await {
            warn!(worker = %self.worker_id, error = %e, "Failed to release lease");
        }
        taken
    }

    async fn take_due(&self) -> Result<Option<Bytes>, StoreError> {
        let now = epoch_millis(SystemTime::now()) as f64;
        let due = self.conn.zrange_by_score(&self.queue_key, 0.0, now).await?;
        let Some(earliest) = due.into_iter().next() else {
            return Ok(None);
        };

        if !self.conn.zrem(&self.queue_key, &earliest).await? {
            debug!(worker = %self.worker_id, "Message was taken by another worker");
            return Ok(None);
        }
        trace!(worker = %self.worker_id, bytes = earliest.len(), "Took due message");
        Ok(Some(earliest))
    }
}

enum State {
    Created,
    Starting,
    Listening(Listener),
    Disposed,
}

/// A delayed message queue over Redis-shaped connections.
///
/// # Example
///
/// ```
/// use flashmq::connection::MemoryConnector;
/// use flashmq::queue::{EnqueueOptions, MessageQueue, QueueOptions, RedisMessageQueue};
/// use std::time::Duration;
/// use tokio::sync::mpsc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), flashmq::queue::QueueError> {
/// let connector = MemoryConnector::new();
/// let queue = RedisMessageQueue::connect(&connector, QueueOptions::default()).await?;
///
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// queue
///     .listen(move |message: String| {
///         let tx = tx.clone();
///         async move {
///             tx.send(message)?;
///             anyhow::Ok(())
///         }
///     })
///     .await?;
///
/// queue.enqueue("Hello, world!", EnqueueOptions::immediate()).await?;
/// assert_eq!(rx.recv().await.as_deref(), Some("Hello, world!"));
///
/// queue.dispose().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisMessageQueue<C = JsonCodec> {
    inner: Arc<Inner<C>>,
    sub_conn: Arc<dyn Connection>,
    state: Mutex<State>,
}

impl<C: Codec> RedisMessageQueue<C> {
    /// Opens the command and subscriber connections through `connector`.
    pub async fn connect(
        connector: &dyn Connector,
        options: QueueOptions<C>,
    ) -> Result<Self, QueueError> {
        validate(&options)?;
        let conn = connector.connect().await?;
        let sub_conn = connector.connect().await?;
        Self::new(conn, sub_conn, options)
    }

    /// Builds a queue over two existing connections. `sub_conn` is dedicated
    /// to the wake-up subscription once the queue listens.
    pub fn new(
        conn: Arc<dyn Connection>,
        sub_conn: Arc<dyn Connection>,
        options: QueueOptions<C>,
    ) -> Result<Self, QueueError> {
        validate(&options)?;
        debug!(
            worker = %options.worker_id,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Created message queue"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                lease: Lease::new(Arc::clone(&conn), options.lock_key),
                conn,
                worker_id: options.worker_id,
                channel_key: options.channel_key,
                queue_key: options.queue_key,
                codec: options.codec,
                poll_interval: options.poll_interval,
            }),
            sub_conn,
            state: Mutex::new(State::Created),
        })
    }

    /// This worker's identity.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// The fallback polling interval.
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Returns true while a handler is registered and running.
    pub fn is_listening(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Listening(_))
    }

    /// Returns true once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Disposed)
    }

    /// Stops listening and closes both connections. The queue cannot be
    /// used afterwards; a second call fails with [`QueueError::Disposed`].
    pub async fn dispose(&self) -> Result<(), QueueError> {
        let previous = std::mem::replace(&mut *self.state.lock().unwrap(), State::Disposed);
        let listener = match previous {
            State::Disposed => return Err(QueueError::Disposed),
            State::Listening(listener) => Some(listener),
            State::Created | State::Starting => None,
        };

        if let Some(listener) = listener {
            listener.shutdown(self.inner.poll_interval).await;
        }

        let primary = self.inner.conn.close().await;
        let subscriber = self.sub_conn.close().await;
        info!(worker = %self.inner.worker_id, "Message queue disposed");
        primary?;
        subscriber?;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), QueueError> {
        match *self.state.lock().unwrap() {
            State::Disposed => Err(QueueError::Disposed),
            _ => Ok(()),
        }
    }

    fn begin_listen(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Created => {
                *state = State::Starting;
                Ok(())
            }
            State::Starting | State::Listening(_) => Err(QueueError::AlreadyListening),
            State::Disposed => Err(QueueError::Disposed),
        }
    }

    fn abort_listen(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Starting) {
            *state = State::Created;
        }
    }

    fn finish_listen(&self, listener: Listener) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Starting) {
            *state = State::Listening(listener);
            Ok(())
        } else {
            // Disposed while subscribing; dropping the listener stops it
            Err(QueueError::Disposed)
        }
    }
}

#[async_trait]
impl<C: Codec> MessageQueue for RedisMessageQueue<C> {
    /// Adds `message` to the sorted set and, when it is due now, publishes a
    /// wake-up notification.
    ///
    /// Encoding and `ZADD` failures are returned. A failed `PUBLISH` is only
    /// logged: the message is already stored, and the next tick delivers it.
    async fn enqueue<T>(&self, message: &T, options: EnqueueOptions) -> Result<(), QueueError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.ensure_live()?;
        let encoded = self.inner.codec.encode(message)?;

        let score = match options.delay {
            Some(delay) if !delay.is_zero() => epoch_millis_ceil(SystemTime::now() + delay),
            _ => 0,
        };
        self.inner
            .conn
            .zadd(&self.inner.queue_key, score as f64, encoded)
            .await?;
        trace!(score, "Enqueued message");

        if score == 0 {
            if let Err(e) = self
                .inner
                .conn
                .publish(&self.inner.channel_key, Bytes::new())
                .await
            {
                warn!(error = %e, "Failed to publish wake-up notification");
            }
        }
        Ok(())
    }

    async fn listen<M, H>(&self, handler: H) -> Result<(), QueueError>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        self.begin_listen()?;

        let subscription = match self.sub_conn.subscribe(&self.inner.channel_key).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.abort_listen();
                return Err(e.into());
            }
        };

        let listener = Listener::start(Arc::clone(&self.inner), subscription, handler);
        self.finish_listen(listener)?;
        info!(worker = %self.inner.worker_id, "Listening for messages");
        Ok(())
    }
}

impl<C> fmt::Debug for RedisMessageQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisMessageQueue")
            .field("worker_id", &self.inner.worker_id)
            .field("queue_key", &self.inner.queue_key)
            .field("poll_interval", &self.inner.poll_interval)
            .finish_non_exhaustive()
    }
}

fn validate<C>(options: &QueueOptions<C>) -> Result<(), QueueError> {
    if options.poll_interval.is_zero() {
        return Err(QueueError::InvalidPollInterval);
    }
    Ok(())
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Epoch milliseconds, rounded up so a due time is never early.
fn epoch_millis_ceil(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64 + u64::from(d.subsec_nanos() % 1_000_000 != 0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryConnection, MemoryConnector, Subscription};
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Instant};

    fn options(poll_interval: Duration) -> QueueOptions {
        QueueOptions::default().with_poll_interval(poll_interval)
    }

    async fn queue(connector: &MemoryConnector, poll_interval: Duration) -> RedisMessageQueue {
        // RUST_LOG=flashmq=trace shows the poll cycle
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        RedisMessageQueue::connect(connector, options(poll_interval))
            .await
            .unwrap()
    }

    /// A handler that forwards every message into a channel.
    fn forward<M: Send + 'static>(
        tx: mpsc::UnboundedSender<M>,
    ) -> impl MessageHandler<M> {
        move |message: M| {
            let tx = tx.clone();
            async move {
                tx.send(message)
                    .map_err(|_| anyhow::anyhow!("test receiver dropped"))?;
                anyhow::Ok(())
            }
        }
    }

    async fn recv_within<M>(rx: &mut mpsc::UnboundedReceiver<M>, limit: Duration) -> M {
        timeout(limit, rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("handler channel closed")
    }

    #[test]
    fn test_epoch_millis_ceil() {
        let exact = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(epoch_millis(exact), 1_500);
        assert_eq!(epoch_millis_ceil(exact), 1_500);

        let between = UNIX_EPOCH + Duration::from_micros(1_500_200);
        assert_eq!(epoch_millis(between), 1_500);
        assert_eq!(epoch_millis_ceil(between), 1_501);
    }

    #[test]
    fn test_default_options() {
        let a = QueueOptions::default();
        let b = QueueOptions::default();

        assert_eq!(&a.channel_key[..], b"fedify_channel");
        assert_eq!(&a.queue_key[..], b"fedify_queue");
        assert_eq!(&a.lock_key[..], b"fedify_lock");
        assert_eq!(a.poll_interval, Duration::from_secs(5));
        assert!(uuid::Uuid::parse_str(&a.worker_id).is_ok());
        assert_ne!(a.worker_id, b.worker_id);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_rejected() {
        let connector = MemoryConnector::new();
        let result = RedisMessageQueue::connect(&connector, options(Duration::ZERO)).await;
        assert!(matches!(result, Err(QueueError::InvalidPollInterval)));
    }

    #[tokio::test]
    async fn test_enqueue_layout() {
        let connector = MemoryConnector::new();
        let engine = connector.engine();
        let queue = queue(&connector, Duration::from_secs(5)).await;
        let mut wakeups = engine.subscribe(Bytes::from_static(b"fedify_channel"));

        queue
            .enqueue("now", EnqueueOptions::immediate())
            .await
            .unwrap();
        assert_eq!(engine.zscore(b"fedify_queue", br#""now""#), Some(0.0));
        assert_eq!(wakeups.try_recv().unwrap(), Bytes::new());

        // A zero delay counts as immediate
        queue
            .enqueue("zero", EnqueueOptions::delayed(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(engine.zscore(b"fedify_queue", br#""zero""#), Some(0.0));
        assert!(wakeups.try_recv().is_ok());

        let before = epoch_millis(SystemTime::now());
        queue
            .enqueue("later", EnqueueOptions::delayed(Duration::from_secs(60)))
            .await
            .unwrap();
        let score = engine.zscore(b"fedify_queue", br#""later""#).unwrap() as u64;
        assert!(score >= before + 60_000 && score <= before + 61_000);

        // Delayed messages are not announced
        assert!(wakeups.try_recv().is_err());
        assert_eq!(engine.zcard(b"fedify_queue"), 3);
    }

    #[tokio::test]
    async fn test_poll_takes_one_message_and_releases_lease() {
        let connector = MemoryConnector::new();
        let engine = connector.engine();
        let queue = queue(&connector, Duration::from_secs(5)).await;

        for message in ["a", "b", "c"] {
            queue
                .enqueue(message, EnqueueOptions::immediate())
                .await
                .unwrap();
        }
        queue
            .enqueue("d", EnqueueOptions::delayed(Duration::from_secs(60)))
            .await
            .unwrap();

        let taken = queue.inner.poll().await.unwrap().unwrap();
        assert_eq!(&taken[..], br#""a""#);
        assert_eq!(engine.zcard(b"fedify_queue"), 3);
        assert_eq!(engine.get(b"fedify_lock"), None);

        queue.inner.poll().await.unwrap().unwrap();
        queue.inner.poll().await.unwrap().unwrap();

        // Only the delayed message is left, and it is not due
        assert_eq!(queue.inner.poll().await.unwrap(), None);
        assert_eq!(engine.zcard(b"fedify_queue"), 1);
        assert_eq!(engine.get(b"fedify_lock"), None);
    }

    #[tokio::test]
    async fn test_poll_skips_while_lease_is_held() {
        let connector = MemoryConnector::new();
        let engine = connector.engine();
        let queue = queue(&connector, Duration::from_secs(5)).await;

        queue
            .enqueue("waiting", EnqueueOptions::immediate())
            .await
            .unwrap();
        engine.set(
            Bytes::from_static(b"fedify_lock"),
            Bytes::from("other-worker"),
            Some(Duration::from_secs(10)),
        );

        assert_eq!(queue.inner.poll().await.unwrap(), None);
        assert_eq!(engine.zcard(b"fedify_queue"), 1);
        assert_eq!(engine.get(b"fedify_lock"), Some(Bytes::from("other-worker")));
    }

    #[tokio::test]
    async fn test_immediate_delivery_uses_notification() {
        let connector = MemoryConnector::new();
        // The first tick is 10 seconds away, so only the wake-up can deliver
        let queue = queue(&connector, Duration::from_secs(10)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();
        assert!(queue.is_listening());

        queue
            .enqueue("Hello, world!", EnqueueOptions::immediate())
            .await
            .unwrap();
        assert_eq!(
            recv_within(&mut rx, Duration::from_secs(1)).await,
            "Hello, world!"
        );

        queue.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_message_arrives_after_immediate_one() {
        let connector = MemoryConnector::new();
        let queue = queue(&connector, Duration::from_millis(200)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();

        let started = Instant::now();
        queue
            .enqueue("A", EnqueueOptions::delayed(Duration::from_secs(3)))
            .await
            .unwrap();
        queue
            .enqueue("B", EnqueueOptions::immediate())
            .await
            .unwrap();

        assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, "B");
        assert_eq!(recv_within(&mut rx, Duration::from_secs(10)).await, "A");
        assert!(started.elapsed() >= Duration::from_secs(3));

        queue.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_workers_never_share_a_message() {
        let connector = MemoryConnector::new();
        let first = queue(&connector, Duration::from_millis(20)).await;
        let second = queue(&connector, Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        first
            .listen(forward::<(String, u32)>(tx.clone()))
            .await
            .unwrap();
        second.listen(forward::<(String, u32)>(tx)).await.unwrap();

        const N: u32 = 50;
        for i in 0..N {
            first
                .enqueue(&("message", i), EnqueueOptions::immediate())
                .await
                .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..N {
            let (_, i) = recv_within(&mut rx, Duration::from_secs(10)).await;
            assert!(seen.insert(i), "message {} delivered twice", i);
        }

        // Nothing else trickles in afterwards
        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(seen.len(), N as usize);
        assert_eq!(connector.engine().zcard(b"fedify_queue"), 0);

        first.dispose().await.unwrap();
        second.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_immediate_messages_drains_at_once() {
        let connector = MemoryConnector::new();
        let queue = queue(&connector, DEFAULT_POLL_INTERVAL).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<u32>(tx)).await.unwrap();

        const N: u32 = 10;
        for i in 0..N {
            queue.enqueue(&i, EnqueueOptions::immediate()).await.unwrap();
        }

        // Well before the first tick
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut seen = HashSet::new();
        for _ in 0..N {
            let wait = deadline.saturating_duration_since(Instant::now());
            let i = recv_within(&mut rx, wait).await;
            assert!(seen.insert(i));
        }
        assert_eq!(connector.engine().zcard(b"fedify_queue"), 0);

        queue.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_shared_by_two_workers_drains_at_once() {
        let connector = MemoryConnector::new();
        let first = queue(&connector, DEFAULT_POLL_INTERVAL).await;
        let second = queue(&connector, DEFAULT_POLL_INTERVAL).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        first.listen(forward::<u32>(tx.clone())).await.unwrap();
        second.listen(forward::<u32>(tx)).await.unwrap();

        const N: u32 = 50;
        for i in 0..N {
            second.enqueue(&i, EnqueueOptions::immediate()).await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = HashSet::new();
        for _ in 0..N {
            let wait = deadline.saturating_duration_since(Instant::now());
            let i = recv_within(&mut rx, wait).await;
            assert!(seen.insert(i), "message {} delivered twice", i);
        }

        first.dispose().await.unwrap();
        second.dispose().await.unwrap();
    }

    /// A connection whose `PUBLISH` always fails.
    struct NoPublish(MemoryConnection);

    #[async_trait]
    impl Connection for NoPublish {
        async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
            self.0.get(key).await
        }

        async fn set(
            &self,
            key: &[u8],
            value: Bytes,
            ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }

        async fn set_nx(
            &self,
            key: &[u8],
            value: Bytes,
            ttl: Option<Duration>,
        ) -> Result<bool, StoreError> {
            self.0.set_nx(key, value, ttl).await
        }

        async fn del(&self, key: &[u8]) -> Result<bool, StoreError> {
            self.0.del(key).await
        }

        async fn zadd(&self, key: &[u8], score: f64, member: Bytes) -> Result<bool, StoreError> {
            self.0.zadd(key, score, member).await
        }

        async fn zrange_by_score(
            &self,
            key: &[u8],
            min: f64,
            max: f64,
        ) -> Result<Vec<Bytes>, StoreError> {
            self.0.zrange_by_score(key, min, max).await
        }

        async fn zrem(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
            self.0.zrem(key, member).await
        }

        async fn publish(&self, _channel: &[u8], _message: Bytes) -> Result<u64, StoreError> {
            Err(StoreError::Server("ERR publish refused".to_string()))
        }

        async fn subscribe(&self, channel: &[u8]) -> Result<Subscription, StoreError> {
            self.0.subscribe(channel).await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_wake_up_leaves_delivery_to_the_ticker() {
        let connector = MemoryConnector::new();
        let queue = RedisMessageQueue::new(
            Arc::new(NoPublish(connector.open())),
            connector.connect().await.unwrap(),
            options(Duration::from_millis(100)),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();

        // Stored and reported as enqueued even though nobody was woken
        queue
            .enqueue("Follow", EnqueueOptions::immediate())
            .await
            .unwrap();
        assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, "Follow");

        queue.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let connector = MemoryConnector::new();
        let queue = queue(&connector, Duration::from_millis(50)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();

        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let result = queue.listen(forward::<String>(other_tx)).await;
        assert!(matches!(result, Err(QueueError::AlreadyListening)));

        // The first handler keeps receiving
        queue
            .enqueue("still here", EnqueueOptions::immediate())
            .await
            .unwrap();
        assert_eq!(
            recv_within(&mut rx, Duration::from_secs(1)).await,
            "still here"
        );
        assert!(other_rx.try_recv().is_err());

        queue.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_delivery_after_dispose() {
        let connector = MemoryConnector::new();
        let engine = Arc::clone(connector.engine());
        let conn = connector.connect().await.unwrap();
        let sub_conn = connector.connect().await.unwrap();
        let queue = RedisMessageQueue::new(
            Arc::clone(&conn),
            Arc::clone(&sub_conn),
            options(Duration::from_millis(20)),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();

        queue.dispose().await.unwrap();
        assert!(queue.is_disposed());
        assert!(!queue.is_listening());

        // A message that becomes due after disposal stays put
        engine
            .zadd(
                Bytes::from_static(b"fedify_queue"),
                0.0,
                Bytes::from_static(br#""orphan""#),
            )
            .unwrap();
        engine.publish(b"fedify_channel", Bytes::new());
        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.zcard(b"fedify_queue"), 1);

        // Both connections were closed
        assert!(matches!(conn.get(b"k").await, Err(StoreError::Closed)));
        assert!(matches!(sub_conn.get(b"k").await, Err(StoreError::Closed)));

        // And the queue refuses further use
        assert!(matches!(
            queue.enqueue("late", EnqueueOptions::immediate()).await,
            Err(QueueError::Disposed)
        ));
        assert!(matches!(
            queue.listen(forward::<String>(mpsc::unbounded_channel().0)).await,
            Err(QueueError::Disposed)
        ));
        assert!(matches!(queue.dispose().await, Err(QueueError::Disposed)));
    }

    #[tokio::test]
    async fn test_dispose_without_listening() {
        let connector = MemoryConnector::new();
        let queue = queue(&connector, Duration::from_secs(5)).await;

        queue
            .enqueue("kept", EnqueueOptions::immediate())
            .await
            .unwrap();
        queue.dispose().await.unwrap();

        assert_eq!(connector.engine().zcard(b"fedify_queue"), 1);
        assert!(matches!(queue.dispose().await, Err(QueueError::Disposed)));
    }

    #[tokio::test]
    async fn test_polling_covers_lost_notifications() {
        let connector = MemoryConnector::new();
        let conn = connector.connect().await.unwrap();
        let sub_conn = connector.connect().await.unwrap();
        let queue = RedisMessageQueue::new(
            conn,
            Arc::clone(&sub_conn),
            options(Duration::from_millis(100)),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<String>(tx)).await.unwrap();

        // The subscriber connection goes away; only the ticker is left
        sub_conn.close().await.unwrap();
        queue
            .enqueue("polled", EnqueueOptions::immediate())
            .await
            .unwrap();

        assert_eq!(recv_within(&mut rx, Duration::from_secs(2)).await, "polled");
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped() {
        let connector = MemoryConnector::new();
        let engine = connector.engine();
        let queue = queue(&connector, Duration::from_millis(20)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<u64>(tx)).await.unwrap();

        engine
            .zadd(
                Bytes::from_static(b"fedify_queue"),
                0.0,
                Bytes::from_static(b"not json"),
            )
            .unwrap();
        queue.enqueue(&7u64, EnqueueOptions::immediate()).await.unwrap();

        assert_eq!(recv_within(&mut rx, Duration::from_secs(2)).await, 7);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.zcard(b"fedify_queue"), 0);

        queue.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_delivery() {
        let connector = MemoryConnector::new();
        let queue = queue(&connector, Duration::from_millis(20)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue
            .listen(move |message: String| {
                let tx = tx.clone();
                async move {
                    anyhow::ensure!(message != "poison", "refusing {}", message);
                    tx.send(message)?;
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();

        queue
            .enqueue("poison", EnqueueOptions::immediate())
            .await
            .unwrap();
        queue
            .enqueue("healthy", EnqueueOptions::immediate())
            .await
            .unwrap();

        assert_eq!(recv_within(&mut rx, Duration::from_secs(2)).await, "healthy");
        sleep(Duration::from_millis(200)).await;
        // Failed messages are not retried
        assert_eq!(connector.engine().zcard(b"fedify_queue"), 0);

        queue.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_keys_and_codec() {
        struct Tagged;

        impl Codec for Tagged {
            fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
                let json = JsonCodec.encode(value)?;
                Ok(Bytes::from([&b"#"[..], &json[..]].concat()))
            }

            fn decode<T: DeserializeOwned>(&self, encoded: &[u8]) -> Result<T, CodecError> {
                JsonCodec.decode(encoded.strip_prefix(b"#").unwrap_or(encoded))
            }
        }

        let connector = MemoryConnector::new();
        let engine = connector.engine();
        let options = QueueOptions::default()
            .with_worker_id("worker-1")
            .with_channel_key("jobs_channel")
            .with_queue_key("jobs")
            .with_lock_key("jobs_lock")
            .with_poll_interval(Duration::from_secs(10))
            .with_codec(Tagged);
        let queue = RedisMessageQueue::connect(&connector, options).await.unwrap();
        assert_eq!(queue.worker_id(), "worker-1");

        queue
            .enqueue(&[1, 2], EnqueueOptions::delayed(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(engine.zscore(b"jobs", b"#[1,2]").is_some());
        assert_eq!(engine.zcard(b"fedify_queue"), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.listen(forward::<Vec<u8>>(tx)).await.unwrap();
        assert_eq!(engine.subscriber_count(b"jobs_channel"), 1);

        queue
            .enqueue(&[3], EnqueueOptions::immediate())
            .await
            .unwrap();
        assert_eq!(recv_within(&mut rx, Duration::from_secs(1)).await, vec![3]);

        queue.dispose().await.unwrap();
    }
}
