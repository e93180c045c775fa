//! SQLite-backed durable store.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository implementing `DurableStore`

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::Repository;
