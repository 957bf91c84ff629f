//! Per-user mutual exclusion.
//!
//! Two strategies implement [`LockCoordinator`]:
//!
//! - [`NoOpLock`] hands out tokens that guard nothing. Concurrent operations on
//!   the same key interleave freely, even inside one process.
//! - [`DistributedLock`] sets a uniquely owned, expiring marker in a shared
//!   [`LockBackend`] (Redis in production, [`MemoryBackend`] in tests), retrying
//!   at a fixed interval while another holder is active.
//!
//! The strategy is picked once by [`connect`]. Critical sections go through
//! [`with_lock`] or a [`LockGuard`], which release on every exit path.

mod distributed;
mod memory;
mod noop;
mod redis_backend;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::UserId;

pub use distributed::*;
pub use memory::*;
pub use noop::*;
pub use redis_backend::*;

#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("Lock {key} is held by another owner (gave up after {attempts} attempts)")]
    Contended { key: String, attempts: u32 },

    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    /// Unique per acquisition; release only succeeds for the same holder.
    pub holder: String,
    /// Point after which the backend may hand the key to someone else.
    pub expires_at: Instant,
}

#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Try to take `key` for `ttl`, giving up once `deadline` passes.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<LockToken, LockError>;

    /// Give up a token. Releasing an expired or foreign token is not an error.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;

    /// Short strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Lock key guarding one user's balance.
pub fn user_lock_key(user_id: UserId) -> String {
    format!("lock:user:{}", user_id)
}

/// Holds a token until released.
///
/// Call [`LockGuard::release`] on the normal path. A guard dropped while still
/// holding its token (panic, cancelled future) schedules the release on the
/// current Tokio runtime; without a runtime the backend TTL reclaims the key.
pub struct LockGuard {
    coordinator: Arc<dyn LockCoordinator>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub async fn acquire(
        coordinator: Arc<dyn LockCoordinator>,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<Self, LockError> {
        let token = coordinator.acquire(key, ttl, deadline).await?;
        debug!(key, strategy = coordinator.name(), "lock acquired");
        Ok(Self {
            coordinator,
            token: Some(token),
        })
    }

    /// Release the lock. Failures are logged; the TTL bounds how long a stale marker lives.
    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release_logged(self.coordinator.as_ref(), &token).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let coordinator = Arc::clone(&self.coordinator);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_logged(coordinator.as_ref(), &token).await;
                });
            }
            Err(_) => warn!(key = %token.key, "lock guard dropped outside a runtime, left to expire"),
        }
    }
}

async fn release_logged(coordinator: &dyn LockCoordinator, token: &LockToken) {
    match coordinator.release(token).await {
        Ok(()) => debug!(key = %token.key, "lock released"),
        Err(err) => warn!(key = %token.key, error = %err, "failed to release lock"),
    }
}

/// Run `body` while holding `key`. The lock is released whatever the body returns.
pub async fn with_lock<T, E, F, Fut>(
    coordinator: &Arc<dyn LockCoordinator>,
    key: &str,
    ttl: Duration,
    deadline: Instant,
    body: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let guard = LockGuard::acquire(Arc::clone(coordinator), key, ttl, deadline).await?;
    let outcome = body().await;
    guard.release().await;
    outcome
}

/// Lock strategy selection and backend coordinates.
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub distributed: bool,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub retry_interval: Duration,
}

/// Build the coordinator for `settings`.
///
/// An unreachable Redis fails here instead of falling back to [`NoOpLock`].
pub async fn connect(settings: &LockSettings) -> Result<Arc<dyn LockCoordinator>, LockError> {
    if !settings.distributed {
        info!("distributed locking disabled, same-user operations are not serialized");
        return Ok(Arc::new(NoOpLock));
    }

    let backend = RedisBackend::connect(redis_connection_info(settings)?).await?;
    info!(
        addr = %settings.redis_addr,
        db = settings.redis_db,
        "distributed locking enabled"
    );
    Ok(Arc::new(DistributedLock::new(backend, settings.retry_interval)))
}
