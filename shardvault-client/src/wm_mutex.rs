//! Write-marker mutex
//!
//! Commits are serialized per allocation by taking a lock on a threshold of
//! blobbers before any shard is staged. A blobber answers `Ok` (granted),
//! `Pending` (held by another connection, retry) or `Failed` (denied).

use crate::blobber::BlobberApi;
use crate::refs::WmLockStatus;
use shardvault_core::{BlobberMask, Result, ShardVaultError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Threshold lock over the blobbers of one allocation.
pub struct WriteMarkerMutex {
    allocation_id: String,
    blobbers: Vec<Arc<dyn BlobberApi>>,
    threshold: usize,
}

/// Set of blobbers currently holding our lock. Must be released with
/// `unlock`; there is no implicit release on drop.
#[derive(Debug)]
pub struct WmLockGuard {
    pub granted: BlobberMask,
}

impl WriteMarkerMutex {
    pub fn new(
        allocation_id: impl Into<String>,
        blobbers: Vec<Arc<dyn BlobberApi>>,
        threshold: usize,
    ) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            blobbers,
            threshold,
        }
    }

    /// Acquire the lock on at least `threshold` blobbers, retrying pending
    /// responses until `timeout` elapses.
    pub async fn lock(&self, connection_id: &str, timeout: Duration) -> Result<WmLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut granted = BlobberMask::empty();

        loop {
            let pending: Vec<usize> = (0..self.blobbers.len())
                .filter(|&i| !granted.is_set(i))
                .collect();
            let attempts = pending.iter().map(|&i| {
                let blobber = Arc::clone(&self.blobbers[i]);
                let allocation_id = self.allocation_id.clone();
                let connection_id = connection_id.to_string();
                async move { (i, blobber.wm_lock(&allocation_id, &connection_id).await) }
            });
            let mut denied = 0usize;
            for (i, outcome) in futures::future::join_all(attempts).await {
                match outcome {
                    Ok(result) if result.status == WmLockStatus::Ok => granted.set(i),
                    Ok(result) if result.status == WmLockStatus::Failed => denied += 1,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(blobber = %self.blobbers[i].blobber_id(), error = %e, "lock request failed");
                    }
                }
            }

            if granted.count() >= self.threshold {
                return Ok(WmLockGuard { granted });
            }
            // Denials are permanent for this attempt; bail out once the
            // threshold is unreachable.
            if granted.count() + (self.blobbers.len() - granted.count() - denied)
                < self.threshold
            {
                self.release(connection_id, &granted).await;
                return Err(ShardVaultError::LockDenied {
                    granted: granted.count(),
                    threshold: self.threshold,
                });
            }
            if Instant::now() + RETRY_INTERVAL > deadline {
                let count = granted.count();
                self.release(connection_id, &granted).await;
                return if count > 0 {
                    Err(ShardVaultError::PartialLock {
                        granted: count,
                        threshold: self.threshold,
                    })
                } else {
                    Err(ShardVaultError::LockTimeout)
                };
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Release the lock everywhere it was granted. Failures are logged and
    /// swallowed; blobber-side leases expire on their own.
    pub async fn unlock(&self, connection_id: &str, guard: WmLockGuard) {
        self.release(connection_id, &guard.granted).await;
    }

    async fn release(&self, connection_id: &str, granted: &BlobberMask) {
        let releases = granted.iter().map(|i| {
            let blobber = Arc::clone(&self.blobbers[i]);
            let allocation_id = self.allocation_id.clone();
            let connection_id = connection_id.to_string();
            async move {
                if let Err(e) = blobber.wm_unlock(&allocation_id, &connection_id).await {
                    warn!(blobber = %blobber.blobber_id(), error = %e, "unlock failed");
                }
            }
        });
        futures::future::join_all(releases).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBlobber;
    use std::sync::atomic::Ordering;

    fn as_api(blobbers: &[Arc<MockBlobber>]) -> Vec<Arc<dyn BlobberApi>> {
        blobbers
            .iter()
            .map(|b| Arc::clone(b) as Arc<dyn BlobberApi>)
            .collect()
    }

    #[tokio::test]
    async fn test_lock_granted_at_threshold() {
        let blobbers = MockBlobber::cluster(4, "alloc");
        let mutex = WriteMarkerMutex::new("alloc", as_api(&blobbers), 3);
        let guard = mutex
            .lock("conn1", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(guard.granted.count() >= 3);
        mutex.unlock("conn1", guard).await;
    }

    #[tokio::test]
    async fn test_lock_denied_when_threshold_unreachable() {
        let blobbers = MockBlobber::cluster(4, "alloc");
        blobbers[0].deny_locks.store(true, Ordering::Relaxed);
        blobbers[1].deny_locks.store(true, Ordering::Relaxed);
        let mutex = WriteMarkerMutex::new("alloc", as_api(&blobbers), 3);
        let err = mutex
            .lock("conn1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardVaultError::LockDenied { .. }));
    }

    #[tokio::test]
    async fn test_pending_lock_retried_until_granted() {
        let blobbers = MockBlobber::cluster(3, "alloc");
        blobbers[2].pending_locks.store(1, Ordering::Relaxed);
        let mutex = WriteMarkerMutex::new("alloc", as_api(&blobbers), 3);
        let guard = mutex
            .lock("conn1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(guard.granted.count(), 3);
        mutex.unlock("conn1", guard).await;
    }

    #[tokio::test]
    async fn test_second_writer_excluded_until_release() {
        let blobbers = MockBlobber::cluster(3, "alloc");
        let mutex = WriteMarkerMutex::new("alloc", as_api(&blobbers), 2);
        let guard = mutex.lock("writer-1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(guard.granted.count(), 3);

        // While writer-1 holds every blobber, writer-2 cannot reach the
        // threshold and times out with nothing granted.
        let err = mutex
            .lock("writer-2", Duration::from_millis(700))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardVaultError::LockTimeout));

        mutex.unlock("writer-1", guard).await;
        let guard = mutex.lock("writer-2", Duration::from_secs(2)).await.unwrap();
        assert!(guard.granted.count() >= 2);
        mutex.unlock("writer-2", guard).await;
    }

    #[tokio::test]
    async fn test_partial_lock_on_timeout() {
        let blobbers = MockBlobber::cluster(3, "alloc");
        blobbers[2].wm_lock("alloc", "other").await.unwrap();
        let mutex = WriteMarkerMutex::new("alloc", as_api(&blobbers), 3);
        let err = mutex
            .lock("conn1", Duration::from_millis(600))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardVaultError::PartialLock { .. }));
        // The partial grants were released on failure.
        let retry = blobbers[0].wm_lock("alloc", "conn2").await.unwrap();
        assert_eq!(retry.status, WmLockStatus::Ok);
    }
}
