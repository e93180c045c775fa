//! Position aggregate: one holding episode for a (user, asset).

use crate::domain::{Asset, Decimal, PositionId, TimeMs, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "open"),
            PositionStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(format!("unknown position status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub asset: Asset,
    pub status: PositionStatus,
    pub current_size: Decimal,
    /// Cost basis of `current_size`, not lifetime spend.
    pub total_cost: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl_abs: Decimal,
    pub transaction_ids: Vec<TransactionId>,
    /// Content fingerprints, index-aligned with `transaction_ids`.
    pub content_keys: Vec<String>,
    pub opened_at: TimeMs,
    pub closed_at: Option<TimeMs>,
    pub updated_at: TimeMs,
}

impl Position {
    /// An empty open episode; the opening buy is applied separately.
    pub fn open(id: PositionId, user_id: UserId, asset: Asset, opened_at: TimeMs) -> Self {
        Position {
            id,
            user_id,
            asset,
            status: PositionStatus::Open,
            current_size: Decimal::zero(),
            total_cost: Decimal::zero(),
            avg_entry_price: Decimal::zero(),
            realized_pnl_abs: Decimal::zero(),
            transaction_ids: Vec::new(),
            content_keys: Vec::new(),
            opened_at,
            closed_at: None,
            updated_at: opened_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.transaction_ids.contains(id)
    }

    /// 1-based ordinal of the member with this content key.
    pub fn entry_index_of(&self, content_key: &str) -> Option<u32> {
        self.content_keys
            .iter()
            .position(|k| k == content_key)
            .map(|i| i as u32 + 1)
    }

    /// Swap a member id in place. Returns true if `old` was a member.
    pub fn replace_transaction_id(&mut self, old: &TransactionId, new: &TransactionId) -> bool {
        match self.transaction_ids.iter_mut().find(|id| *id == old) {
            Some(slot) => {
                *slot = new.clone();
                true
            }
            None => false,
        }
    }

    /// The read model handed to consumers.
    pub fn view(&self) -> PositionView {
        PositionView {
            status: self.status,
            current_size: self.current_size,
            total_cost: self.total_cost,
            avg_entry_price: self.avg_entry_price,
            realized_pnl_abs: self.realized_pnl_abs,
            transaction_ids: self.transaction_ids.clone(),
        }
    }
}

/// Position read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionView {
    pub status: PositionStatus,
    pub current_size: Decimal,
    pub total_cost: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl_abs: Decimal,
    #[serde(rename = "transactionIds")]
    pub transaction_ids: Vec<TransactionId>,
}
