use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::BalanceService;
use crate::domain::{format_cents, Cents, LedgerEntry, UserId};

/// One user's ledger as exported to JSON
#[derive(Debug, Clone, Serialize)]
pub struct HistorySnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub user_id: UserId,
    pub balance_cents: Cents,
    pub entries: Vec<LedgerEntry>,
}

/// Exporter for writing a user's ledger history in various formats
pub struct Exporter<'a> {
    service: &'a BalanceService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a BalanceService) -> Self {
        Self { service }
    }

    /// Export a user's entries to CSV, newest first
    pub async fn export_history_csv<W: Write>(
        &self,
        user_id: UserId,
        limit: Option<usize>,
        writer: W,
    ) -> Result<usize> {
        let entries = self.service.history(user_id, limit).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "user_id",
            "kind",
            "amount_cents",
            "amount",
            "created_at",
        ])?;

        for entry in &entries {
            csv_writer.write_record(&[
                entry.id.to_string(),
                entry.user_id.to_string(),
                entry.kind.as_str().to_string(),
                entry.amount_cents.to_string(),
                format_cents(entry.amount_cents),
                entry.created_at.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(entries.len())
    }

    /// Export a user's balance and entries as a JSON document
    pub async fn export_history_json<W: Write>(
        &self,
        user_id: UserId,
        limit: Option<usize>,
        mut writer: W,
    ) -> Result<HistorySnapshot> {
        let balance_cents = self.service.balance(user_id).await?;
        let entries = self.service.history(user_id, limit).await?;

        let snapshot = HistorySnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            user_id,
            balance_cents,
            entries,
        };

        serde_json::to_writer_pretty(&mut writer, &snapshot)?;
        writeln!(writer)?;
        writer.flush()?;

        Ok(snapshot)
    }
}
