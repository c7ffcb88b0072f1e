//! Listener Tasks
//!
//! A listening queue runs three Tokio tasks:
//!
//! ```text
//!   ┌──────────┐  tick   ┌──────────────┐
//!   │  Ticker  │───────▶ │              │  poll   ┌─────────────┐
//!   └──────────┘         │  Dispatcher  │───────▶ │ Delayed set │
//!   ┌──────────┐  wake   │  (one poll   │         └─────────────┘
//!   │ Notifier │───────▶ │   at a time) │──spawn──▶ handler(message)
//!   └──────────┘         └──────────────┘
//! ```
//!
//! Both trigger sources `try_send` into a channel with room for one pending
//! trigger, so a burst of ticks and notifications collapses into a single
//! pending trigger. On each trigger the dispatcher keeps polling until no
//! message is due, so a collapsed burst of enqueues is still drained at once.
//! Polls run serially and every handler call runs on its own task; a slow
//! handler never holds up the next poll.
//!
//! If the notification stream ends (the subscriber connection dropped), the
//! ticker keeps the queue draining at the polling interval.

use crate::codec::Codec;
use crate::connection::Subscription;
use crate::queue::Inner;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Receives decoded messages from a listening queue.
///
/// Closures returning a future implement this trait:
///
/// ```
/// use flashmq::queue::MessageHandler;
///
/// fn assert_handler<M, H: MessageHandler<M>>(_: H) {}
///
/// assert_handler(|message: String| async move {
///     println!("received {}", message);
///     anyhow::Ok(())
/// });
/// ```
///
/// An error is logged and the message is not retried.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    /// Handles one message.
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// The running tasks of a listening queue.
#[derive(Debug)]
pub(crate) struct Listener {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Spawns the ticker, notifier and dispatcher tasks.
    pub(crate) fn start<C, M, H>(inner: Arc<Inner<C>>, subscription: Subscription, handler: H) -> Self
    where
        C: Codec,
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let dispatcher = Dispatcher {
            inner: Arc::clone(&inner),
            handler: Arc::new(handler),
            _message: PhantomData,
        };

        let tasks = vec![
            tokio::spawn(ticker(
                inner.poll_interval,
                trigger_tx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(notifier(subscription, trigger_tx, shutdown_rx.clone())),
            tokio::spawn(dispatcher.run(trigger_rx, shutdown_rx)),
        ];

        Self { shutdown_tx, tasks }
    }

    /// Signals every task to stop and waits up to `grace` for them, aborting
    /// whatever is still running afterwards.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        let deadline = Instant::now() + grace;
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if time::timeout_at(deadline, task).await.is_err() {
                warn!("Listener task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn ticker(
    period: Duration,
    triggers: mpsc::Sender<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                // A full channel already holds a pending poll
                let _ = triggers.try_send(());
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    trace!("Ticker stopped");
}

async fn notifier(
    mut subscription: Subscription,
    triggers: mpsc::Sender<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            notification = subscription.recv() => match notification {
                Some(_) => {
                    let _ = triggers.try_send(());
                }
                None => {
                    warn!("Notification channel closed, relying on polling");
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    trace!("Notifier stopped");
}

struct Dispatcher<C, M, H> {
    inner: Arc<Inner<C>>,
    handler: Arc<H>,
    _message: PhantomData<fn() -> M>,
}

impl<C, M, H> Dispatcher<C, M, H>
where
    C: Codec,
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
{
    async fn run(self, mut triggers: mpsc::Receiver<()>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                }
            }

            self.drain(&shutdown_rx).await;
        }
        debug!(worker = %self.inner.worker_id, "Dispatcher stopped");
    }

    /// Polls until nothing is due, the lease is held elsewhere, or a poll
    /// fails. Coalesced triggers may stand for many messages.
    async fn drain(&self, shutdown_rx: &watch::Receiver<bool>) {
        let mut taken = 0usize;
        loop {
            match self.inner.poll().await {
                Ok(Some(payload)) => {
                    self.dispatch(&payload);
                    taken += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Poll failed, retrying on next trigger");
                    break;
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
        if taken > 1 {
            debug!(worker = %self.inner.worker_id, taken, "Drained due messages");
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        let message: M = match self.inner.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, bytes = payload.len(), "Dropping undecodable message");
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            if let Err(e) = handler.handle(message).await {
                error!(error = %format!("{:#}", e), "Message handler failed");
            }
        });
    }
}
