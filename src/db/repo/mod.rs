//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct, the SQLite implementation of
//! `DurableStore`. Methods are organized across submodules by record type:
//! - `transactions.rs` - Transaction rows
//! - `positions.rs` - Position rows

mod positions;
mod transactions;

use crate::domain::{Asset, Decimal, Position, PositionId, Transaction, TransactionId, UserId};
use crate::store::{DurableStore, StoreError, StoreEvent};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::warn;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            other => StoreError::Other(other.to_string()),
        }
    }
}

/// Parse a decimal column, naming the column in the error.
fn decimal_column(column: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| {
        warn!(column = %column, value = %raw, error = %e, "Failed to parse stored decimal");
        StoreError::Corrupt(format!("{}: {}", column, raw))
    })
}

/// SQLite-backed durable store.
pub struct Repository {
    pool: SqlitePool,
    events: broadcast::Sender<StoreEvent>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(64);
        Repository { pool, events }
    }

    /// Push the user's current transaction set to subscribers.
    async fn publish_snapshot(&self, user_id: &UserId) {
        if self.events.receiver_count() == 0 {
            return;
        }
        match self.select_user_transactions(user_id).await {
            Ok(transactions) => {
                let _ = self.events.send(StoreEvent::Snapshot {
                    user_id: user_id.clone(),
                    transactions,
                });
            }
            Err(e) => warn!(user = %user_id, error = %e, "Failed to publish snapshot"),
        }
    }
}

#[async_trait]
impl DurableStore for Repository {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<TransactionId, StoreError> {
        let id = self.insert_transaction_row(tx).await?;
        self.publish_snapshot(&tx.user_id).await;
        Ok(id)
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.update_transaction_row(tx).await?;
        self.publish_snapshot(&tx.user_id).await;
        Ok(())
    }

    async fn delete_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<(), StoreError> {
        if self.delete_transaction_row(user_id, id).await? {
            self.publish_snapshot(user_id).await;
        }
        Ok(())
    }

    async fn query_transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.select_transactions(user_id, asset).await
    }

    async fn query_user_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.select_user_transactions(user_id).await
    }

    async fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError> {
        self.select_position(id).await
    }

    async fn query_positions(
        &self,
        user_id: &UserId,
        asset: Option<&Asset>,
    ) -> Result<Vec<Position>, StoreError> {
        self.select_positions(user_id, asset).await
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.upsert_position_row(position).await
    }

    async fn delete_position(&self, id: &PositionId) -> Result<(), StoreError> {
        self.delete_position_row(id).await
    }

    fn subscribe(&self, _user_id: &UserId) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
