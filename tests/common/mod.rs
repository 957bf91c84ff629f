// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use saldo::application::{BalanceService, ServiceSettings};
use saldo::domain::{Cents, EntryId, EntryKind, LedgerEntry, UserId};
use saldo::lock::{DistributedLock, LockCoordinator, MemoryBackend, NoOpLock};
use saldo::storage::{LedgerStore, Repository};
use tempfile::TempDir;
use tokio::sync::Barrier;

pub const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Helper to create a repository backed by a temporary database file
pub async fn test_repository() -> Result<(Arc<Repository>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let repo = Repository::init(&database_url(&temp_dir)).await?;
    Ok((Arc::new(repo), temp_dir))
}

/// URL of the database file inside `temp_dir`, for opening a second connection pool
pub fn database_url(temp_dir: &TempDir) -> String {
    format!(
        "sqlite:{}?mode=rwc",
        temp_dir.path().join("test.db").display()
    )
}

pub fn settings() -> ServiceSettings {
    timings(Duration::from_secs(5), Duration::from_secs(2))
}

pub fn timings(lock_ttl: Duration, operation_timeout: Duration) -> ServiceSettings {
    ServiceSettings::new(lock_ttl, operation_timeout).expect("valid service timings")
}

/// Repository on the database in `temp_dir` whose writes wait at most `busy_timeout`
pub async fn repository_with_busy_timeout(
    temp_dir: &TempDir,
    busy_timeout: Duration,
) -> Result<Arc<Repository>> {
    let repo = Repository::connect_with(&database_url(temp_dir), busy_timeout).await?;
    Ok(Arc::new(repo))
}

pub fn distributed_lock(backend: &MemoryBackend) -> Arc<dyn LockCoordinator> {
    Arc::new(DistributedLock::new(backend.clone(), RETRY_INTERVAL))
}

/// Service with a Redis-like lock shared through `backend`
pub fn distributed_service(
    store: Arc<dyn LedgerStore>,
    backend: &MemoryBackend,
    settings: ServiceSettings,
) -> BalanceService {
    BalanceService::new(store, distributed_lock(backend), settings)
}

/// Service with distributed locking disabled
pub fn noop_service(store: Arc<dyn LedgerStore>) -> BalanceService {
    BalanceService::new(store, Arc::new(NoOpLock), settings())
}

/// Test fixture: seed a user's balance with a single deposit
pub async fn fund(repo: &Repository, user_id: UserId, amount_cents: Cents) -> Result<()> {
    repo.append(user_id, amount_cents, EntryKind::Deposit).await?;
    Ok(())
}

/// Holds every balance read until `parties` callers have read,
/// forcing their check-then-append sequences to overlap.
pub struct BarrierLedger {
    inner: Arc<dyn LedgerStore>,
    barrier: Barrier,
}

impl BarrierLedger {
    pub fn new(inner: Arc<dyn LedgerStore>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait]
impl LedgerStore for BarrierLedger {
    async fn append(&self, user_id: UserId, amount_cents: Cents, kind: EntryKind) -> Result<EntryId> {
        self.inner.append(user_id, amount_cents, kind).await
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents> {
        let balance = self.inner.current_balance(user_id).await?;
        self.barrier.wait().await;
        Ok(balance)
    }

    async fn entries_for_user(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for_user(user_id, limit).await
    }
}

/// Reads succeed, appends fail as if the database went away mid-request.
pub struct FailingLedger {
    inner: Arc<dyn LedgerStore>,
}

impl FailingLedger {
    pub fn new(inner: Arc<dyn LedgerStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LedgerStore for FailingLedger {
    async fn append(&self, _user_id: UserId, _amount_cents: Cents, _kind: EntryKind) -> Result<EntryId> {
        Err(anyhow!("disk I/O error"))
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents> {
        self.inner.current_balance(user_id).await
    }

    async fn entries_for_user(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for_user(user_id, limit).await
    }
}

/// Delays every balance read before touching the inner store.
pub struct SlowLedger {
    inner: Arc<dyn LedgerStore>,
    delay: Duration,
}

impl SlowLedger {
    pub fn new(inner: Arc<dyn LedgerStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl LedgerStore for SlowLedger {
    async fn append(&self, user_id: UserId, amount_cents: Cents, kind: EntryKind) -> Result<EntryId> {
        self.inner.append(user_id, amount_cents, kind).await
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents> {
        tokio::time::sleep(self.delay).await;
        self.inner.current_balance(user_id).await
    }

    async fn entries_for_user(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for_user(user_id, limit).await
    }
}
