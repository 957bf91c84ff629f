use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::domain::{format_cents, Cents, EntryId, EntryKind, LedgerEntry, UserId};
use crate::lock::{user_lock_key, with_lock, LockCoordinator};
use crate::storage::LedgerStore;

use super::BalanceError;

/// Timing limits applied to every mutating call.
///
/// A critical section may start its ledger write as late as the operation
/// deadline, and that write may then wait up to `operation_timeout` for the
/// store. The lock TTL must cover both, so `lock_ttl >= 2 * operation_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    lock_ttl: Duration,
    operation_timeout: Duration,
}

impl ServiceSettings {
    pub fn new(lock_ttl: Duration, operation_timeout: Duration) -> Result<Self> {
        ensure!(!lock_ttl.is_zero(), "lock TTL must be positive");
        ensure!(
            !operation_timeout.is_zero(),
            "operation timeout must be positive"
        );
        ensure!(
            operation_timeout * 2 <= lock_ttl,
            "lock TTL ({} ms) must be at least twice the operation timeout ({} ms), or a lock could expire mid-operation",
            lock_ttl.as_millis(),
            operation_timeout.as_millis()
        );

        Ok(Self {
            lock_ttl,
            operation_timeout,
        })
    }

    /// Lifetime of a lock marker.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Budget for acquiring the lock and starting the ledger write. Also the
    /// longest a store should wait on a busy database.
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            operation_timeout: Duration::from_millis(2500),
        }
    }
}

/// Outcome of a successful deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub user_id: UserId,
    pub applied_amount: Cents,
    pub entry_id: EntryId,
    pub kind: EntryKind,
}

/// Deposits and withdrawals as per-user critical sections.
/// Built once at startup and shared by every caller.
pub struct BalanceService {
    store: Arc<dyn LedgerStore>,
    locks: Arc<dyn LockCoordinator>,
    settings: ServiceSettings,
}

impl BalanceService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        locks: Arc<dyn LockCoordinator>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            locks,
            settings,
        }
    }

    /// Name of the lock strategy in use ("noop" or "distributed").
    pub fn lock_strategy(&self) -> &'static str {
        self.locks.name()
    }

    /// Credit `amount_cents` to a user.
    ///
    /// Deposits never read the balance, but still run under the user's lock so
    /// that writes for one user are ordered.
    #[instrument(level = "debug", skip(self), fields(strategy = self.locks.name()))]
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount_cents: Cents,
    ) -> Result<Receipt, BalanceError> {
        validate_amount(amount_cents)?;

        self.critical_section(user_id, |deadline| async move {
            ensure_before(deadline)?;
            let entry_id = self
                .store
                .append(user_id, amount_cents, EntryKind::Deposit)
                .await?;

            Ok(Receipt {
                user_id,
                applied_amount: amount_cents,
                entry_id,
                kind: EntryKind::Deposit,
            })
        })
        .await
    }

    /// Debit `amount_cents` from a user if the balance covers it.
    ///
    /// The balance read and the append happen under one lock acquisition, and
    /// neither starts once the operation deadline has passed. With
    /// [`crate::lock::NoOpLock`] nothing stops two withdrawals from both passing
    /// the check, which can drive the balance below zero.
    #[instrument(level = "debug", skip(self), fields(strategy = self.locks.name()))]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount_cents: Cents,
    ) -> Result<Receipt, BalanceError> {
        validate_amount(amount_cents)?;

        self.critical_section(user_id, |deadline| async move {
            ensure_before(deadline)?;
            let balance = self.store.current_balance(user_id).await?;
            if balance < amount_cents {
                warn!(user_id, balance, requested = amount_cents, "insufficient funds");
                return Err(BalanceError::InsufficientFunds {
                    user_id,
                    balance,
                    requested: amount_cents,
                });
            }

            ensure_before(deadline)?;
            let entry_id = self
                .store
                .append(user_id, amount_cents, EntryKind::Withdraw)
                .await?;

            Ok(Receipt {
                user_id,
                applied_amount: amount_cents,
                entry_id,
                kind: EntryKind::Withdraw,
            })
        })
        .await
    }

    /// Current derived balance. Unlocked, so it may miss an in-flight operation.
    pub async fn balance(&self, user_id: UserId) -> Result<Cents, BalanceError> {
        Ok(self.store.current_balance(user_id).await?)
    }

    /// A user's entries, newest first.
    pub async fn history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>, BalanceError> {
        Ok(self.store.entries_for_user(user_id, limit).await?)
    }

    /// Close the ledger store. Call once when the process is done with the service.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }

    /// Run `body` holding the user's lock. The body gets the operation deadline
    /// and checks it between store calls; a store call already under way is
    /// never cut off, so the lock outlives every write made under it.
    async fn critical_section<T, F, Fut>(&self, user_id: UserId, body: F) -> Result<T, BalanceError>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = Result<T, BalanceError>>,
    {
        let deadline = Instant::now() + self.settings.operation_timeout;
        let key = user_lock_key(user_id);

        with_lock(&self.locks, &key, self.settings.lock_ttl, deadline, || body(deadline)).await
    }
}

fn ensure_before(deadline: Instant) -> Result<(), BalanceError> {
    if Instant::now() >= deadline {
        return Err(BalanceError::DeadlineExceeded);
    }
    Ok(())
}

fn validate_amount(amount_cents: Cents) -> Result<(), BalanceError> {
    if amount_cents <= 0 {
        return Err(BalanceError::Validation(format!(
            "amount must be positive, got {}",
            format_cents(amount_cents)
        )));
    }
    Ok(())
}
