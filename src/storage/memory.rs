use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::domain::{compute_balance, Cents, EntryId, EntryKind, LedgerEntry, UserId};

use super::LedgerStore;

/// An in-process ledger for tests and throwaway runs. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn append(
        &self,
        user_id: UserId,
        amount_cents: Cents,
        kind: EntryKind,
    ) -> Result<EntryId> {
        anyhow::ensure!(
            amount_cents > 0,
            "Ledger amounts must be positive, got {}",
            amount_cents
        );

        let mut entries = self.entries.write();
        let id = entries.len() as EntryId + 1;
        entries.push(LedgerEntry {
            id,
            user_id,
            amount_cents,
            kind,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents> {
        Ok(compute_balance(user_id, &self.entries.read()))
    }

    async fn entries_for_user(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
