//! Local key-value fallback cache, scoped per user.
//!
//! This module provides:
//! - The synchronous `LocalCache` seam
//! - An in-memory implementation for tests
//! - A JSON-file implementation that survives restarts

use crate::domain::UserId;
use std::fmt;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

/// Synchronous key-value storage, one namespace per user.
pub trait LocalCache: Send + Sync + fmt::Debug {
    fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove(&self, user_id: &UserId, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
