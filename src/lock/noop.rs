use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockCoordinator, LockError, LockToken};

const NOOP_HOLDER: &str = "noop";

/// Coordinator used when distributed locking is disabled.
///
/// Every acquisition succeeds at once and releases do nothing, so two
/// operations on the same user may run their read and write steps interleaved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLock;

#[async_trait]
impl LockCoordinator for NoOpLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        _deadline: Instant,
    ) -> Result<LockToken, LockError> {
        Ok(LockToken {
            key: key.to_string(),
            holder: NOOP_HOLDER.to_string(),
            expires_at: Instant::now() + ttl,
        })
    }

    async fn release(&self, _token: &LockToken) -> Result<(), LockError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
