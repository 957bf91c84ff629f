use thiserror::Error;

use crate::domain::{format_cents, Cents, UserId};
use crate::lock::LockError;

#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("Invalid amount: {0}")]
    Validation(String),

    #[error(
        "Insufficient funds for user {user_id}: balance {}, requested {}",
        format_cents(*balance),
        format_cents(*requested)
    )]
    InsufficientFunds {
        user_id: UserId,
        balance: Cents,
        requested: Cents,
    },

    #[error("Could not obtain lock {key}, another operation is in progress")]
    LockContention { key: String },

    #[error("Lock backend unavailable: {0}")]
    LockBackendUnavailable(String),

    #[error("Operation deadline passed before the ledger was written")]
    DeadlineExceeded,

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl BalanceError {
    /// Only contention is transient; everything else fails the same way on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BalanceError::LockContention { .. })
    }

    /// Stable short label for logs and machine-readable output.
    pub fn kind(&self) -> &'static str {
        match self {
            BalanceError::Validation(_) => "validation",
            BalanceError::InsufficientFunds { .. } => "insufficient_funds",
            BalanceError::LockContention { .. } => "lock_contention",
            BalanceError::LockBackendUnavailable(_) => "lock_backend_unavailable",
            BalanceError::DeadlineExceeded => "deadline_exceeded",
            BalanceError::Storage(_) => "storage",
        }
    }
}

impl From<LockError> for BalanceError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contended { key, .. } => BalanceError::LockContention { key },
            LockError::Unavailable(reason) => BalanceError::LockBackendUnavailable(reason),
        }
    }
}
