//! Position row operations for the repository.

use crate::domain::{Asset, Position, PositionId, PositionStatus, TimeMs, TransactionId, UserId};
use crate::store::StoreError;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{decimal_column, Repository};

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, asset, status, current_size, total_cost, avg_entry_price,
           realized_pnl_abs, transaction_ids, content_keys, opened_at_ms,
           closed_at_ms, updated_at_ms
    FROM positions
"#;

fn row_to_position(row: &SqliteRow) -> Result<Position, StoreError> {
    let asset: String = row.get("asset");
    let status: String = row.get("status");
    let transaction_ids: String = row.get("transaction_ids");
    let content_keys: String = row.get("content_keys");

    // Member ids are stored verbatim and may still be local-pending.
    let transaction_ids: Vec<TransactionId> = serde_json::from_str(&transaction_ids)
        .map_err(|e| StoreError::Corrupt(format!("transaction_ids: {}", e)))?;
    let content_keys: Vec<String> = serde_json::from_str(&content_keys)
        .map_err(|e| StoreError::Corrupt(format!("content_keys: {}", e)))?;

    Ok(Position {
        id: PositionId::new(row.get::<String, _>("id")),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        asset: Asset::new(&asset).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: status.parse::<PositionStatus>().map_err(StoreError::Corrupt)?,
        current_size: decimal_column("current_size", &row.get::<String, _>("current_size"))?,
        total_cost: decimal_column("total_cost", &row.get::<String, _>("total_cost"))?,
        avg_entry_price: decimal_column(
            "avg_entry_price",
            &row.get::<String, _>("avg_entry_price"),
        )?,
        realized_pnl_abs: decimal_column(
            "realized_pnl_abs",
            &row.get::<String, _>("realized_pnl_abs"),
        )?,
        transaction_ids,
        content_keys,
        opened_at: TimeMs::new(row.get::<i64, _>("opened_at_ms")),
        closed_at: row.get::<Option<i64>, _>("closed_at_ms").map(TimeMs::new),
        updated_at: TimeMs::new(row.get::<i64, _>("updated_at_ms")),
    })
}

impl Repository {
    pub(super) async fn select_position(
        &self,
        id: &PositionId,
    ) -> Result<Option<Position>, StoreError> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_position).transpose()
    }

    /// Positions of a user in opening order, optionally for one asset.
    pub(super) async fn select_positions(
        &self,
        user_id: &UserId,
        asset: Option<&Asset>,
    ) -> Result<Vec<Position>, StoreError> {
        let rows = match asset {
            Some(asset) => {
                let sql = format!(
                    "{} WHERE user_id = ? AND asset = ? ORDER BY opened_at_ms ASC, id ASC",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(user_id.as_str())
                    .bind(asset.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "{} WHERE user_id = ? ORDER BY asset ASC, opened_at_ms ASC, id ASC",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(user_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_position).collect()
    }

    /// Insert or fully overwrite a position row.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub(super) async fn upsert_position_row(&self, position: &Position) -> Result<(), StoreError> {
        let transaction_ids = serde_json::to_string(&position.transaction_ids)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let content_keys = serde_json::to_string(&position.content_keys)
            .map_err(|e| StoreError::Other(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, user_id, asset, status, current_size, total_cost, avg_entry_price,
                realized_pnl_abs, transaction_ids, content_keys, opened_at_ms,
                closed_at_ms, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_size = excluded.current_size,
                total_cost = excluded.total_cost,
                avg_entry_price = excluded.avg_entry_price,
                realized_pnl_abs = excluded.realized_pnl_abs,
                transaction_ids = excluded.transaction_ids,
                content_keys = excluded.content_keys,
                opened_at_ms = excluded.opened_at_ms,
                closed_at_ms = excluded.closed_at_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(position.id.as_str())
        .bind(position.user_id.as_str())
        .bind(position.asset.as_str())
        .bind(position.status.to_string())
        .bind(position.current_size.to_canonical_string())
        .bind(position.total_cost.to_canonical_string())
        .bind(position.avg_entry_price.to_canonical_string())
        .bind(position.realized_pnl_abs.to_canonical_string())
        .bind(transaction_ids)
        .bind(content_keys)
        .bind(position.opened_at.as_i64())
        .bind(position.closed_at.map(|t| t.as_i64()))
        .bind(position.updated_at.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(super) async fn delete_position_row(&self, id: &PositionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM positions WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
