use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::{Cents, EntryId, EntryKind, LedgerEntry, UserId};

use super::{LedgerStore, MIGRATION_001_LEDGER};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BALANCE_EXPR: &str = "COALESCE(SUM(CASE kind WHEN 'deposit' THEN amount_cents WHEN 'withdraw' THEN -amount_cents END), 0)";

/// Statistics for ledger integrity verification.
#[derive(Debug, Clone)]
pub struct IntegrityStats {
    pub entry_count: i64,
    pub user_count: i64,
    pub invalid_amounts: i64,
    /// Users whose derived balance is below zero, with that balance.
    pub negative_balances: Vec<(UserId, Cents)>,
}

impl IntegrityStats {
    pub fn is_healthy(&self) -> bool {
        self.invalid_amounts == 0 && self.negative_balances.is_empty()
    }
}

/// SQLite-backed ledger store.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database URL such as `sqlite:ledger.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Connect with a bound on how long a statement waits for another
    /// connection's write lock before failing with "database is locked".
    pub async fn connect_with(database_url: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations. Safe to run against an initialized database.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_LEDGER)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        Self::init_with(database_url, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Initialize a database whose writes give up after `busy_timeout`.
    pub async fn init_with(database_url: &str, busy_timeout: Duration) -> Result<Self> {
        let repo = Self::connect_with(database_url, busy_timeout).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Every entry in the ledger, oldest first.
    pub async fn list_entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT id, user_id, amount_cents, kind, created_at FROM ledger_entries ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list ledger entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Gather statistics used by the integrity check.
    pub async fn integrity_stats(&self) -> Result<IntegrityStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS entry_count,
                COUNT(DISTINCT user_id) AS user_count,
                COALESCE(SUM(CASE WHEN amount_cents <= 0 THEN 1 ELSE 0 END), 0) AS invalid_amounts
            FROM ledger_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count ledger entries")?;

        let negative_rows = sqlx::query(&format!(
            "SELECT user_id, {BALANCE_EXPR} AS balance FROM ledger_entries GROUP BY user_id HAVING balance < 0 ORDER BY user_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to find negative balances")?;

        Ok(IntegrityStats {
            entry_count: row.get("entry_count"),
            user_count: row.get("user_count"),
            invalid_amounts: row.get("invalid_amounts"),
            negative_balances: negative_rows
                .iter()
                .map(|r| (r.get("user_id"), r.get("balance")))
                .collect(),
        })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<LedgerEntry> {
        let kind_str: String = row.get("kind");
        let created_at_str: String = row.get("created_at");

        Ok(LedgerEntry {
            id: row.get("id"),
            user_id: row.get("user_id"),
            amount_cents: row.get("amount_cents"),
            kind: EntryKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid entry kind: {}", kind_str))?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .context("Invalid created_at timestamp")?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl LedgerStore for Repository {
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

        // Fixed-width timestamps keep lexical order equal to time order
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let row = sqlx::query(
            r#"
            INSERT INTO ledger_entries (user_id, amount_cents, kind, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount_cents)
        .bind(kind.as_str())
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to append ledger entry")?;

        let id: EntryId = row.get("id");
        debug!(user_id, amount_cents, %kind, entry_id = id, "appended ledger entry");
        Ok(id)
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_EXPR} AS balance FROM ledger_entries WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute balance")?;

        Ok(row.get("balance"))
    }

    async fn entries_for_user(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount_cents, kind, created_at
            FROM ledger_entries
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ledger entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_repo() -> Result<Repository> {
        // A single connection so every query sees the same in-memory database
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let repo = Repository::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    #[tokio::test]
    async fn test_balance_aggregates_by_kind() -> Result<()> {
        let repo = memory_repo().await?;

        assert_eq!(repo.current_balance(1).await?, 0);

        repo.append(1, 10000, EntryKind::Deposit).await?;
        repo.append(1, 2550, EntryKind::Withdraw).await?;
        repo.append(2, 700, EntryKind::Deposit).await?;

        assert_eq!(repo.current_balance(1).await?, 7450);
        assert_eq!(repo.current_balance(2).await?, 700);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_rejects_non_positive_amounts() -> Result<()> {
        let repo = memory_repo().await?;

        assert!(repo.append(1, 0, EntryKind::Deposit).await.is_err());
        assert!(repo.append(1, -5, EntryKind::Withdraw).await.is_err());
        assert!(repo.list_entries().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_entries_for_user_newest_first_with_limit() -> Result<()> {
        let repo = memory_repo().await?;

        let first = repo.append(3, 100, EntryKind::Deposit).await?;
        let second = repo.append(3, 200, EntryKind::Deposit).await?;
        let third = repo.append(3, 50, EntryKind::Withdraw).await?;
        repo.append(4, 999, EntryKind::Deposit).await?;

        let all = repo.entries_for_user(3, None).await?;
        let ids: Vec<EntryId> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![third, second, first]);
        assert_eq!(all[0].kind, EntryKind::Withdraw);

        let limited = repo.entries_for_user(3, Some(2)).await?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, third);
        Ok(())
    }

    #[tokio::test]
    async fn test_integrity_stats_reports_negative_balances() -> Result<()> {
        let repo = memory_repo().await?;

        repo.append(1, 500, EntryKind::Deposit).await?;
        repo.append(2, 500, EntryKind::Deposit).await?;
        repo.append(2, 800, EntryKind::Withdraw).await?;

        let stats = repo.integrity_stats().await?;
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.user_count, 2);
        assert_eq!(stats.invalid_amounts, 0);
        assert_eq!(stats.negative_balances, vec![(2, -300)]);
        assert!(!stats.is_healthy());
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_repository_fails_with_error() -> Result<()> {
        let repo = memory_repo().await?;
        repo.close().await;

        assert!(repo.append(1, 100, EntryKind::Deposit).await.is_err());
        assert!(repo.current_balance(1).await.is_err());
        Ok(())
    }
}
