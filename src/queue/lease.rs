//! Lease-Based Mutual Exclusion
//!
//! A lease is a single shared key that records which worker may currently
//! drain the delayed queue. It is taken with one atomic `SET key holder NX PX
//! ttl`, so a lease always carries its expiry: a holder that crashes without
//! releasing it only blocks other workers until the TTL runs out.
//!
//! Release deletes the key without checking who holds it. If a lease expired
//! and another worker took it before the first holder released, that release
//! clears the second worker's lease. The holder is only recorded for
//! diagnostics.

use crate::connection::{Connection, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A time-bounded exclusive claim stored under one key.
pub struct Lease {
    conn: Arc<dyn Connection>,
    key: Bytes,
}

impl Lease {
    /// Creates a lease stored under `key`.
    pub fn new(conn: Arc<dyn Connection>, key: impl Into<Bytes>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    /// The key the lease is stored under.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Takes the lease for `holder` if nobody holds it. The lease expires on
    /// its own after `ttl`.
    pub async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let acquired = self
            .conn
            .set_nx(&self.key, Bytes::copy_from_slice(holder.as_bytes()), Some(ttl))
            .await?;
        trace!(holder, acquired, ttl_ms = ttl.as_millis() as u64, "Lease acquisition");
        Ok(acquired)
    }

    /// Gives the lease up.
    pub async fn release(&self, holder: &str) -> Result<(), StoreError> {
        let existed = self.conn.del(&self.key).await?;
        trace!(holder, existed, "Lease released");
        Ok(())
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connector, MemoryConnector};

    async fn lease(connector: &MemoryConnector) -> Lease {
        Lease::new(connector.connect().await.unwrap(), "fedify_lock")
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let connector = MemoryConnector::new();
        let a = lease(&connector).await;
        let b = lease(&connector).await;
        let ttl = Duration::from_secs(10);

        assert!(a.try_acquire("worker-a", ttl).await.unwrap());
        assert!(!b.try_acquire("worker-b", ttl).await.unwrap());
        assert!(!a.try_acquire("worker-a", ttl).await.unwrap());
        assert_eq!(
            connector.engine().get(b"fedify_lock"),
            Some(Bytes::from("worker-a"))
        );

        a.release("worker-a").await.unwrap();
        assert!(b.try_acquire("worker-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_sets_expiry() {
        let connector = MemoryConnector::new();
        let lease = lease(&connector).await;

        assert!(lease
            .try_acquire("worker", Duration::from_secs(10))
            .await
            .unwrap());
        let pttl = connector.engine().pttl(b"fedify_lock").unwrap();
        assert!(pttl > 9_000 && pttl <= 10_000, "pttl = {}", pttl);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let connector = MemoryConnector::new();
        let crashed = lease(&connector).await;
        let other = lease(&connector).await;

        assert!(crashed
            .try_acquire("crashed", Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(other
            .try_acquire("other", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_does_not_check_holder() {
        let connector = MemoryConnector::new();
        let stale = lease(&connector).await;
        let current = lease(&connector).await;

        assert!(current
            .try_acquire("current", Duration::from_secs(10))
            .await
            .unwrap());
        stale.release("stale").await.unwrap();

        assert_eq!(connector.engine().get(b"fedify_lock"), None);
    }

    #[tokio::test]
    async fn test_release_without_lease_is_harmless() {
        let connector = MemoryConnector::new();
        let lease = lease(&connector).await;

        lease.release("nobody").await.unwrap();
        assert!(lease
            .try_acquire("worker", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
