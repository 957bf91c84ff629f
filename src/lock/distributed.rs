use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{LockCoordinator, LockError, LockToken};

/// Shared store of expiring ownership markers.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `holder` for `ttl` unless a live marker exists. Returns whether it was set.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Remove `key` only if it is still owned by `holder`. Returns whether it was removed.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError>;
}

/// Mutual exclusion across every process sharing the same backend.
///
/// Acquisition retries every `retry_interval` until the earlier of the
/// caller's deadline and one TTL from the first attempt.
pub struct DistributedLock<B> {
    backend: B,
    retry_interval: Duration,
}

impl<B: LockBackend> DistributedLock<B> {
    pub fn new(backend: B, retry_interval: Duration) -> Self {
        Self {
            backend,
            retry_interval,
        }
    }
}

#[async_trait]
impl<B: LockBackend> LockCoordinator for DistributedLock<B> {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<LockToken, LockError> {
        let holder = Uuid::new_v4().to_string();
        let window_end = deadline.min(Instant::now() + ttl);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempted_at = Instant::now();

            if self.backend.try_acquire(key, &holder, ttl).await? {
                debug!(key, attempts, "distributed lock obtained");
                return Ok(LockToken {
                    key: key.to_string(),
                    holder,
                    expires_at: attempted_at + ttl,
                });
            }

            let next_attempt = Instant::now() + self.retry_interval;
            if next_attempt > window_end {
                warn!(key, attempts, "lock contended, giving up");
                return Err(LockError::Contended {
                    key: key.to_string(),
                    attempts,
                });
            }
            tokio::time::sleep_until(next_attempt).await;
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        if !self.backend.release(&token.key, &token.holder).await? {
            // Expired and possibly taken by someone else; nothing of ours to remove
            debug!(key = %token.key, "lock marker already gone at release");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}
