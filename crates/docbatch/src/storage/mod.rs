//! Storage module for durable batch state
//!
//! Provides SQLite-based persistence for batch snapshots and engine records.

mod database;
mod persistence;

pub use database::{BatchDb, SnapshotRow};
pub use persistence::PersistenceAdapter;
