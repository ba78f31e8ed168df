//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::adapter::{check_quota, entry_size, StorageAdapter};
use crate::error::StorageError;

/// A [`StorageAdapter`] held entirely in memory.
///
/// Optionally enforces a hard quota, and can be told to reject every write
/// as over quota to exercise the fallback paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, String>>,
  quota: Option<u64>,
  reject_writes: AtomicBool,
  rejected: AtomicUsize,
}

impl MemoryStorage {
  /// An unbounded store.
  pub fn new() -> Self {
    Self::default()
  }

  /// A store that refuses writes beyond `quota` bytes.
  pub fn with_quota(quota: u64) -> Self {
    Self {
      quota: Some(quota),
      ..Self::default()
    }
  }

  /// Make every subsequent `set` fail with `QuotaExceeded`.
  pub fn reject_writes(&self, reject: bool) {
    self.reject_writes.store(reject, Ordering::SeqCst);
  }

  /// Number of writes refused so far.
  pub fn rejected_writes(&self) -> usize {
    self.rejected.load(Ordering::SeqCst)
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
    self
      .entries
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }

  fn reject(&self, key: &str, value: &str) -> StorageError {
    self.rejected.fetch_add(1, Ordering::SeqCst);
    StorageError::QuotaExceeded {
      key: key.to_string(),
      requested: entry_size(key, value),
      available: 0,
    }
  }
}

impl StorageAdapter for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    if self.reject_writes.load(Ordering::SeqCst) {
      return Err(self.reject(key, value));
    }

    let mut entries = self.lock()?;
    let used: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    let existing = entries.get(key).map_or(0, |v| entry_size(key, v));
    if let Err(e) = check_quota(key, value, existing, used, self.quota) {
      self.rejected.fetch_add(1, Ordering::SeqCst);
      return Err(e);
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn clear(&self) -> Result<(), StorageError> {
    self.lock()?.clear();
    Ok(())
  }
}
