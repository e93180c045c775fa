//! Domain types and determinism layer for the position ledger.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, UserId, Asset, Side, PositionId
//! - Transaction and Position records
//! - Stable transaction ordering for deterministic processing

pub mod decimal;
pub mod ordering;
pub mod position;
pub mod primitives;
pub mod transaction;

pub use decimal::Decimal;
pub use ordering::{sort_transactions_deterministic, TransactionOrderingKey};
pub use position::{Position, PositionStatus, PositionView};
pub use primitives::{Asset, EmptyAssetError, PositionId, Side, TimeMs, UnknownSideError, UserId};
pub use transaction::{
    NewTransaction, Transaction, TransactionEdit, TransactionId, ValidationError, PENDING_ID_PREFIX,
};
