//! Durable store abstraction for transactions and positions.

use crate::domain::{Asset, Position, PositionId, Transaction, TransactionId, UserId};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::MemoryStore;

/// Live-subscription events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Current durable transaction set of a subscribed user.
    Snapshot {
        user_id: UserId,
        transactions: Vec<Transaction>,
    },
    /// Connectivity to the store was lost.
    Disconnected,
}

/// Durable keyed store for transaction and position records.
///
/// Implementations assign transaction ids on insert; the id carried by the
/// inserted record is ignored.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    /// Insert a transaction and return its durable id.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<TransactionId, StoreError>;

    /// Overwrite an existing transaction record.
    ///
    /// # Errors
    /// `StoreError::NotFound` if no record has `tx.id`.
    async fn update_transaction(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Delete a transaction. Deleting a missing record succeeds.
    async fn delete_transaction(&self, user_id: &UserId, id: &TransactionId)
        -> Result<(), StoreError>;

    /// All transactions of a user for one asset, in no particular order.
    async fn query_transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// All transactions of a user.
    async fn query_user_transactions(&self, user_id: &UserId)
        -> Result<Vec<Transaction>, StoreError>;

    async fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError>;

    /// Positions of a user, optionally restricted to one asset.
    async fn query_positions(
        &self,
        user_id: &UserId,
        asset: Option<&Asset>,
    ) -> Result<Vec<Position>, StoreError>;

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError>;

    async fn delete_position(&self, id: &PositionId) -> Result<(), StoreError>;

    /// Subscribe to live events for `user_id`.
    fn subscribe(&self, user_id: &UserId) -> broadcast::Receiver<StoreEvent>;
}

/// Error type for durable store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store unreachable (offline, connection refused, pool exhausted).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// No response within the write budget.
    #[error("Store operation timed out after {0}ms")]
    Timeout(u64),
    #[error("Record not found: {0}")]
    NotFound(String),
    /// The store handed out an id inside the local-pending namespace.
    #[error("Store returned invalid id: {0}")]
    InvalidId(String),
    /// Stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// True for failures the façade absorbs with its local fallback.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("offline".to_string());
        assert_eq!(err.to_string(), "Store unavailable: offline");

        let err = StoreError::Timeout(5000);
        assert_eq!(err.to_string(), "Store operation timed out after 5000ms");

        let err = StoreError::NotFound("tx-1".to_string());
        assert_eq!(err.to_string(), "Record not found: tx-1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("x".to_string()).is_transient());
        assert!(StoreError::Timeout(1).is_transient());
        assert!(!StoreError::NotFound("x".to_string()).is_transient());
        assert!(!StoreError::Corrupt("x".to_string()).is_transient());
    }
}
