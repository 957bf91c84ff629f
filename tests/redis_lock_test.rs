//! Runs against a live Redis when `REDIS_TEST_ADDR` (host:port) is set, and
//! skips otherwise.

use std::time::Duration;

use anyhow::Result;
use saldo::lock::{redis_connection_info, LockBackend, LockSettings, RedisBackend};
use uuid::Uuid;

async fn redis_backend() -> Result<Option<RedisBackend>> {
    let Ok(addr) = std::env::var("REDIS_TEST_ADDR") else {
        eprintln!("REDIS_TEST_ADDR not set, skipping");
        return Ok(None);
    };

    let settings = LockSettings {
        distributed: true,
        redis_addr: addr,
        redis_password: std::env::var("REDIS_TEST_PASSWORD").ok(),
        redis_db: 0,
        retry_interval: Duration::from_millis(100),
    };
    let backend = RedisBackend::connect(redis_connection_info(&settings)?).await?;
    Ok(Some(backend))
}

fn unique_key() -> String {
    format!("lock:user:test-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_second_holder_is_refused() -> Result<()> {
    let Some(backend) = redis_backend().await? else {
        return Ok(());
    };
    let key = unique_key();
    let ttl = Duration::from_secs(5);

    assert!(backend.try_acquire(&key, "holder-a", ttl).await?);
    assert!(!backend.try_acquire(&key, "holder-b", ttl).await?);

    assert!(backend.release(&key, "holder-a").await?);
    Ok(())
}

#[tokio::test]
async fn test_foreign_release_removes_nothing() -> Result<()> {
    let Some(backend) = redis_backend().await? else {
        return Ok(());
    };
    let key = unique_key();
    let ttl = Duration::from_secs(5);

    assert!(backend.try_acquire(&key, "owner", ttl).await?);
    assert!(!backend.release(&key, "intruder").await?);

    // Still held by the owner
    assert!(!backend.try_acquire(&key, "intruder", ttl).await?);

    assert!(backend.release(&key, "owner").await?);
    Ok(())
}

#[tokio::test]
async fn test_owner_release_frees_the_key() -> Result<()> {
    let Some(backend) = redis_backend().await? else {
        return Ok(());
    };
    let key = unique_key();
    let ttl = Duration::from_secs(5);

    assert!(backend.try_acquire(&key, "first", ttl).await?);
    assert!(backend.release(&key, "first").await?);

    assert!(backend.try_acquire(&key, "second", ttl).await?);
    assert!(!backend.release(&key, "first").await?);
    assert!(backend.release(&key, "second").await?);
    Ok(())
}

#[tokio::test]
async fn test_marker_expires_after_ttl() -> Result<()> {
    let Some(backend) = redis_backend().await? else {
        return Ok(());
    };
    let key = unique_key();

    assert!(backend.try_acquire(&key, "short-lived", Duration::from_millis(100)).await?);
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(backend.try_acquire(&key, "next", Duration::from_secs(5)).await?);
    assert!(!backend.release(&key, "short-lived").await?);
    assert!(backend.release(&key, "next").await?);
    Ok(())
}
