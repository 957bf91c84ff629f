use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError, Script};

use super::{LockBackend, LockError, LockSettings};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Deletes the key only while it still holds the caller's holder id.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock markers stored as plain Redis keys with a millisecond expiry.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Open a managed connection and check it with `PING`.
    pub async fn connect(info: ConnectionInfo) -> Result<Self, LockError> {
        let client = redis::Client::open(info).map_err(unavailable)?;

        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| LockError::Unavailable("timed out connecting to redis".to_string()))?
            .map_err(unavailable)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(Self::new(conn))
    }
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let ttl_ms = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        let mut conn = self.conn.clone();

        // SET NX replies OK when set and nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        let removed: i64 = self
            .release_script
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(removed == 1)
    }
}

fn unavailable(err: RedisError) -> LockError {
    LockError::Unavailable(err.to_string())
}

/// Connection parameters for the lock server in `settings`.
pub fn redis_connection_info(settings: &LockSettings) -> Result<ConnectionInfo, LockError> {
    let addr = settings.redis_addr.trim();
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                LockError::Unavailable(format!("invalid redis address: {}", addr))
            })?;
            (host, port)
        }
        None => (addr, DEFAULT_REDIS_PORT),
    };

    if host.is_empty() {
        return Err(LockError::Unavailable(format!(
            "invalid redis address: {}",
            addr
        )));
    }

    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            db: settings.redis_db,
            username: None,
            password: settings.redis_password.clone().filter(|p| !p.is_empty()),
            ..Default::default()
        },
    })
}
