//! Stable transaction ordering for deterministic valuation and replay.

use crate::domain::Transaction;

/// Stable ordering key for transactions of one asset.
///
/// Ordering: date -> created_at -> buy before sell -> id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransactionOrderingKey<'a> {
    /// Economic effective date (primary sort).
    pub date_ms: i64,
    /// Persistence time (same-day tie-break).
    pub created_at_ms: i64,
    /// Buys rank before sells so inventory exists before it is disposed of.
    pub side_rank: u8,
    /// Final lexicographic tie-break.
    pub id: &'a str,
}

impl<'a> TransactionOrderingKey<'a> {
    pub fn from_transaction(tx: &'a Transaction) -> Self {
        TransactionOrderingKey {
            date_ms: tx.date.as_i64(),
            created_at_ms: tx.created_at.as_i64(),
            side_rank: tx.side.settle_rank(),
            id: tx.id.as_str(),
        }
    }

    /// Returns true if `a` should come before `b`.
    pub fn should_come_before(a: &Transaction, b: &Transaction) -> bool {
        TransactionOrderingKey::from_transaction(a) < TransactionOrderingKey::from_transaction(b)
    }
}

/// Sort transactions deterministically in place.
pub fn sort_transactions_deterministic(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| {
        TransactionOrderingKey::from_transaction(a).cmp(&TransactionOrderingKey::from_transaction(b))
    });
}

/// Sorted copy of borrowed transactions.
pub fn sorted_refs(transactions: &[Transaction]) -> Vec<&Transaction> {
    let mut refs: Vec<&Transaction> = transactions.iter().collect();
    refs.sort_by(|a, b| {
        TransactionOrderingKey::from_transaction(a).cmp(&TransactionOrderingKey::from_transaction(b))
    });
    refs
}
