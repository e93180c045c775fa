pub mod cache;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod store;

pub use cache::{CacheError, FileCache, LocalCache, MemoryCache};
pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    Asset, Decimal, NewTransaction, Position, PositionId, PositionStatus, PositionView, Side,
    TimeMs, Transaction, TransactionEdit, TransactionId, UserId,
};
pub use engine::{valuate, ValuationResult};
pub use error::LedgerError;
pub use orchestration::{Durability, PositionManager, RepairReport, TransactionStore, WriteOutcome};
pub use store::{DurableStore, MemoryStore, StoreError, StoreEvent};
