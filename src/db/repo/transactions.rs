//! Transaction row operations for the repository.

use crate::domain::{Asset, PositionId, Side, TimeMs, Transaction, TransactionId, UserId};
use crate::store::StoreError;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{decimal_column, Repository};

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, asset, side, amount, price, date_ms, created_at_ms,
           position_id, entry_index, notes
    FROM transactions
"#;

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction, StoreError> {
    let id: String = row.get("id");
    let asset: String = row.get("asset");
    let side: String = row.get("side");
    let amount: String = row.get("amount");
    let price: Option<String> = row.get("price");

    Ok(Transaction {
        id: TransactionId::durable(id.clone()).ok_or(StoreError::InvalidId(id))?,
        user_id: UserId::new(row.get::<String, _>("user_id")),
        asset: Asset::new(&asset).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        side: side
            .parse::<Side>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        amount: decimal_column("amount", &amount)?,
        price: price.map(|p| decimal_column("price", &p)).transpose()?,
        date: TimeMs::new(row.get::<i64, _>("date_ms")),
        created_at: TimeMs::new(row.get::<i64, _>("created_at_ms")),
        position_id: row.get::<Option<String>, _>("position_id").map(PositionId::new),
        entry_index: row
            .get::<Option<i64>, _>("entry_index")
            .map(|i| {
                u32::try_from(i).map_err(|_| StoreError::Corrupt(format!("entry_index: {}", i)))
            })
            .transpose()?,
        notes: row.get("notes"),
    })
}

impl Repository {
    /// Insert a transaction under a freshly minted durable id.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub(super) async fn insert_transaction_row(
        &self,
        tx: &Transaction,
    ) -> Result<TransactionId, StoreError> {
        let raw_id = uuid::Uuid::new_v4().to_string();
        let id = TransactionId::durable(raw_id.clone()).ok_or(StoreError::InvalidId(raw_id))?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, user_id, asset, side, amount, price, date_ms, created_at_ms,
                position_id, entry_index, notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(tx.user_id.as_str())
        .bind(tx.asset.as_str())
        .bind(tx.side.to_string())
        .bind(tx.amount.to_canonical_string())
        .bind(tx.price.map(|p| p.to_canonical_string()))
        .bind(tx.date.as_i64())
        .bind(tx.created_at.as_i64())
        .bind(tx.position_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(tx.entry_index.map(i64::from))
        .bind(tx.notes.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Overwrite the mutable columns of an existing transaction.
    ///
    /// # Errors
    /// `StoreError::NotFound` if no row matches the id and user.
    pub(super) async fn update_transaction_row(&self, tx: &Transaction) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET price = ?, date_ms = ?, notes = ?, position_id = ?, entry_index = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(tx.price.map(|p| p.to_canonical_string()))
        .bind(tx.date.as_i64())
        .bind(tx.notes.as_deref())
        .bind(tx.position_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(tx.entry_index.map(i64::from))
        .bind(tx.id.as_str())
        .bind(tx.user_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(tx.id.to_string()));
        }
        Ok(())
    }

    /// Returns true if a row was removed.
    pub(super) async fn delete_transaction_row(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ? AND user_id = ?")
            .bind(id.as_str())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn select_transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "{} WHERE user_id = ? AND asset = ? ORDER BY date_ms ASC, created_at_ms ASC, id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(asset.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_transaction).collect()
    }

    pub(super) async fn select_user_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "{} WHERE user_id = ? ORDER BY asset ASC, date_ms ASC, created_at_ms ASC, id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_transaction).collect()
    }
}
