use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Cents;

/// Identity of a balance holder. Owned by an external user directory.
pub type UserId = i64;

/// Store-assigned identifier of a ledger entry.
pub type EntryId = i64;

/// Direction of a ledger entry's effect on the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Withdraw,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdraw => "withdraw",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deposit" => Some(EntryKind::Deposit),
            "withdraw" => Some(EntryKind::Withdraw),
            _ => None,
        }
    }

    /// Signed effect of `amount_cents` on the balance.
    pub fn signed(&self, amount_cents: Cents) -> Cents {
        match self {
            EntryKind::Deposit => amount_cents,
            EntryKind::Withdraw => -amount_cents,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable movement in a user's ledger.
/// The amount is always positive; `kind` carries the sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub amount_cents: Cents,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> Cents {
        self.kind.signed(self.amount_cents)
    }
}
