//! Quota-bounded key/value persistence.
//!
//! This module provides:
//! - A [`StorageAdapter`] trait over string key/value stores with explicit
//!   quota errors, plus in-memory and SQLite backends
//! - The [`Envelope`] every persisted value is wrapped in
//! - A [`StorageGuard`] that budgets usage and evicts in tiers

mod adapter;
mod guard;
mod memory;
mod sqlite;

pub use adapter::{entry_size, stored_at, Envelope, StorageAdapter};
pub use guard::{
  CleanupReport, EvictionTier, GuardConfig, KeyClass, StorageGuard, StorageItem, StorageUsage,
};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
