mod memory;
mod repository;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Cents, EntryId, EntryKind, LedgerEntry, UserId};

pub use memory::*;
pub use repository::*;

/// SQL migration for the ledger table
pub const MIGRATION_001_LEDGER: &str = include_str!("migrations/001_ledger.sql");

/// Append-only log of balance movements.
///
/// Implementations hold no locks across calls. Callers that need a read and a
/// subsequent append to be atomic must serialize them externally.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one entry. `amount_cents` must be positive.
    async fn append(&self, user_id: UserId, amount_cents: Cents, kind: EntryKind)
        -> Result<EntryId>;

    /// Current derived balance, zero for a user without entries.
    async fn current_balance(&self, user_id: UserId) -> Result<Cents>;

    /// Entries for a user, newest first.
    async fn entries_for_user(&self, user_id: UserId, limit: Option<usize>)
        -> Result<Vec<LedgerEntry>>;

    /// Release underlying resources. Further calls may fail.
    async fn close(&self) {}
}
