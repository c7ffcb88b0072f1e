//! Background Expiry Sweeper
//!
//! Lazy expiry only removes a key when somebody touches it. A queue lock that
//! expired after its holder crashed, or a cached value nobody reads again,
//! would otherwise stay in memory forever. The sweeper is a Tokio task that
//! periodically:
//!
//! 1. removes expired strings from every shard
//! 2. drops pub/sub channels that have no subscribers left
//!
//! The interval adapts to the workload: it halves while a large share of keys
//! keep expiring and doubles while nothing does, within configured bounds.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval before the first sweep (default: 100ms)
    pub base_interval: Duration,

    /// Lower bound for the interval (default: 10ms)
    pub min_interval: Duration,

    /// Upper bound for the interval (default: 1s)
    pub max_interval: Duration,

    /// Expired fraction of keys above which the sweeper speeds up
    pub speedup_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
        }
    }
}

impl ExpiryConfig {
    /// Computes the interval for the next sweep.
    fn next_interval(&self, current: Duration, keys_before: u64, expired: u64) -> Duration {
        if keys_before == 0 || expired == 0 {
            return (current * 2).min(self.max_interval);
        }
        let rate = expired as f64 / keys_before as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else {
            current
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// The sweeper stops when this handle is dropped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper on the current Tokio runtime.
    ///
    /// # Example
    ///
    /// ```
    /// use flashmq::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let engine = Arc::new(StorageEngine::new());
    /// let sweeper = ExpirySweeper::start(engine, ExpiryConfig::default());
    ///
    /// // Dropping the handle stops the task
    /// drop(sweeper);
    /// # }
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));
        info!("Background expiry sweeper started");
        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let keys_before = engine.len();
        let expired = engine.cleanup_expired();
        let pruned = engine.prune_channels();

        let next = config.next_interval(interval, keys_before, expired);
        if next != interval {
            trace!(
                expired = expired,
                keys_before = keys_before,
                new_interval_ms = next.as_millis() as u64,
                "Adjusted sweep interval"
            );
            interval = next;
        }

        if expired > 0 || pruned > 0 {
            debug!(
                expired = expired,
                channels_pruned = pruned,
                keys_remaining = engine.len(),
                "Sweep reclaimed entries"
            );
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}
