//! Transaction record and its validated input shapes.

use crate::domain::{Asset, Decimal, PositionId, Side, TimeMs, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix reserved for ids minted while the durable store is unreachable.
pub const PENDING_ID_PREFIX: &str = "local-";

/// Largest accepted amount or unit price.
pub const MAX_QUANTITY: i64 = 1_000_000_000_000_000;

/// Largest accepted `amount * price` of a single transaction.
pub const MAX_NOTIONAL: i64 = 1_000_000_000_000_000_000;

fn check_range(amount: Decimal, price: Option<Decimal>) -> Result<(), ValidationError> {
    let limit = Decimal::from(MAX_QUANTITY);
    if amount > limit {
        return Err(ValidationError::OutOfRange("amount", amount));
    }
    let Some(price) = price else {
        return Ok(());
    };
    if price > limit {
        return Err(ValidationError::OutOfRange("price", price));
    }
    match amount.checked_mul(price) {
        Some(notional) if notional <= Decimal::from(MAX_NOTIONAL) => Ok(()),
        Some(notional) => Err(ValidationError::OutOfRange("notional", notional)),
        None => Err(ValidationError::OutOfRange("notional", amount)),
    }
}

/// Transaction identifier in either the durable or the local-pending namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap an id handed out by the durable store.
    ///
    /// Returns `None` if the id intrudes on the pending namespace.
    pub fn durable(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.starts_with(PENDING_ID_PREFIX) || id.is_empty() {
            None
        } else {
            Some(TransactionId(id))
        }
    }

    /// Mint a fresh local-pending id.
    pub fn pending() -> Self {
        TransactionId(format!("{}{}", PENDING_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single buy or sell of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub asset: Asset,
    #[serde(rename = "type")]
    pub side: Side,
    pub amount: Decimal,
    /// `None` while the price is pending enrichment.
    pub price: Option<Decimal>,
    /// Economic effective date.
    pub date: TimeMs,
    /// Persistence wall-clock, tie-break only.
    pub created_at: TimeMs,
    pub position_id: Option<PositionId>,
    pub entry_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Transaction {
    /// Unit price used by cost arithmetic; a missing price counts as zero.
    pub fn unit_price(&self) -> Decimal {
        self.price.unwrap_or_default()
    }

    /// Fingerprint of the economic content, independent of id and linkage.
    ///
    /// A pending copy and its durable twin share this key.
    pub fn content_key(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_str());
        hasher.update([0u8]);
        hasher.update(self.asset.as_str());
        hasher.update([0u8]);
        hasher.update(if self.side == Side::Buy { b"B" } else { b"S" });
        hasher.update(self.amount.to_canonical_string());
        hasher.update([0u8]);
        match &self.price {
            Some(price) => hasher.update(price.to_canonical_string()),
            None => hasher.update(b"-"),
        }
        hasher.update(self.date.as_i64().to_le_bytes());
        hasher.update(self.created_at.as_i64().to_le_bytes());
        let hash = hasher.finalize();
        format!("content:{}", hex::encode(&hash[..16]))
    }

    /// Apply user edits to the editable fields.
    ///
    /// Returns true if anything changed.
    pub fn apply_edit(&mut self, edit: &TransactionEdit) -> Result<bool, ValidationError> {
        let mut changed = false;
        if let Some(price) = edit.price {
            if price.is_negative() {
                return Err(ValidationError::NegativePrice(price));
            }
            check_range(self.amount, Some(price))?;
            if self.price != Some(price) {
                self.price = Some(price);
                changed = true;
            }
        }
        if let Some(date) = edit.date {
            if self.date != date {
                self.date = date;
                changed = true;
            }
        }
        if let Some(notes) = &edit.notes {
            if self.notes.as_ref() != Some(notes) {
                self.notes = Some(notes.clone());
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Unvalidated input for a new transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub asset: String,
    #[serde(rename = "type")]
    pub side: String,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub date: TimeMs,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewTransaction {
    pub fn new(asset: &str, side: Side, amount: Decimal, price: Decimal, date: TimeMs) -> Self {
        NewTransaction {
            asset: asset.to_string(),
            side: side.to_string(),
            amount,
            price: Some(price),
            date,
            notes: None,
        }
    }

    /// Validate and stamp into a pending-id transaction owned by `user_id`.
    ///
    /// The id is replaced once the durable store assigns one.
    pub fn validate(self, user_id: &UserId, created_at: TimeMs) -> Result<Transaction, ValidationError> {
        let asset = Asset::new(&self.asset).map_err(|_| ValidationError::EmptyAsset)?;
        let side = self
            .side
            .parse::<Side>()
            .map_err(|e| ValidationError::UnknownType(e.0))?;
        if !self.amount.is_positive() {
            return Err(ValidationError::NonPositiveAmount(self.amount));
        }
        if let Some(price) = self.price {
            if price.is_negative() {
                return Err(ValidationError::NegativePrice(price));
            }
        }
        check_range(self.amount, self.price)?;

        Ok(Transaction {
            id: TransactionId::pending(),
            user_id: user_id.clone(),
            asset,
            side,
            amount: self.amount,
            price: self.price,
            date: self.date,
            created_at,
            position_id: None,
            entry_index: None,
            notes: self.notes,
        })
    }
}

/// The bounded set of user-editable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEdit {
    pub price: Option<Decimal>,
    pub date: Option<TimeMs>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("price must not be negative, got {0}")]
    NegativePrice(Decimal),
    #[error("unknown transaction type: {0}")]
    UnknownType(String),
    #[error("asset symbol must not be empty")]
    EmptyAsset,
    #[error("{0} out of range: {1}")]
    OutOfRange(&'static str, Decimal),
}
