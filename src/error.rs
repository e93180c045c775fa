use crate::cache::CacheError;
use crate::domain::ValidationError;
use crate::engine::TrackerError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid transaction: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Position error: {0}")]
    Position(#[from] TrackerError),
    #[error("Not found: {0}")]
    NotFound(String),
}
