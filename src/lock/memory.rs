use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{LockBackend, LockError};

#[derive(Debug)]
struct Marker {
    holder: String,
    expires_at: Instant,
}

/// Process-local lock backend with the same owner and expiry rules as Redis.
///
/// Clones share the same markers, so several [`super::DistributedLock`]s built
/// from one backend behave like service instances sharing a Redis server.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    markers: Arc<Mutex<HashMap<String, Marker>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live owner of `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.markers
            .lock()
            .get(key)
            .filter(|marker| marker.expires_at > now)
            .map(|marker| marker.holder.clone())
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.holder(key).is_some()
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut markers = self.markers.lock();

        if markers.get(key).is_some_and(|marker| marker.expires_at > now) {
            return Ok(false);
        }

        markers.insert(
            key.to_string(),
            Marker {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut markers = self.markers.lock();

        let owned = markers
            .get(key)
            .filter(|marker| marker.holder == holder)
            .map(|marker| marker.expires_at > now);

        match owned {
            Some(live) => {
                markers.remove(key);
                Ok(live)
            }
            None => Ok(false),
        }
    }
}
