use super::{Cents, LedgerEntry, UserId};

/// Compute a user's balance from a list of entries.
/// Balance = sum of deposits - sum of withdrawals. Entries of other users are ignored.
pub fn compute_balance(user_id: UserId, entries: &[LedgerEntry]) -> Cents {
    entries
        .iter()
        .filter(|entry| entry.user_id == user_id)
        .map(LedgerEntry::signed_amount)
        .sum()
}
