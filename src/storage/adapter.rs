//! Storage adapter trait and the persisted value envelope.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A string key/value store with a hard quota.
///
/// Mirrors the small surface of browser Web Storage. `set` reports quota
/// exhaustion as [`StorageError::QuotaExceeded`] rather than failing
/// opaquely, so callers can evict and retry.
pub trait StorageAdapter: Send + Sync {
  /// Read a value.
  fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

  /// Write a value, replacing any existing one.
  fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

  /// Remove a key. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// All keys currently stored.
  fn keys(&self) -> Result<Vec<String>, StorageError>;

  /// Remove everything.
  fn clear(&self) -> Result<(), StorageError> {
    for key in self.keys()? {
      self.remove(&key)?;
    }
    Ok(())
  }
}

/// Bytes a key/value pair is charged against the budget.
///
/// Counts UTF-16 code units at two bytes each, which is how browsers size
/// Web Storage. An approximation, not exact quota accounting.
pub fn entry_size(key: &str, value: &str) -> u64 {
  let units = key.encode_utf16().count() + value.encode_utf16().count();
  units as u64 * 2
}

/// Wrapper around every value this crate persists.
///
/// `stored_at` is what age-based eviction reads, so eviction never has to
/// guess at timestamp fields inside arbitrary payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
  /// Milliseconds since the epoch when the value was written.
  pub stored_at: i64,
  pub payload: T,
}

impl<T> Envelope<T> {
  pub fn new(stored_at: i64, payload: T) -> Self {
    Self { stored_at, payload }
  }
}

impl<T: Serialize> Envelope<T> {
  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
  stored_at: i64,
  #[allow(dead_code)]
  payload: IgnoredAny,
}

/// Read only the `storedAt` of an enveloped value.
///
/// Returns `None` for anything that is not an envelope.
pub fn stored_at(raw: &str) -> Option<i64> {
  serde_json::from_str::<EnvelopeHeader>(raw)
    .ok()
    .map(|h| h.stored_at)
}

/// Check whether replacing `key` with `value` keeps a store within `quota`.
///
/// `current_used` is the store's usage including any existing value at
/// `key`, whose size is passed as `existing`.
pub(crate) fn check_quota(
  key: &str,
  value: &str,
  existing: u64,
  current_used: u64,
  quota: Option<u64>,
) -> Result<(), StorageError> {
  let Some(quota) = quota else {
    return Ok(());
  };
  let requested = entry_size(key, value);
  let projected = current_used.saturating_sub(existing) + requested;
  if projected > quota {
    return Err(StorageError::QuotaExceeded {
      key: key.to_string(),
      requested,
      available: quota.saturating_sub(current_used.saturating_sub(existing)),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_size_counts_utf16_units() {
    assert_eq!(entry_size("ab", "cd"), 8);
    // U+1F600 is a surrogate pair in UTF-16
    assert_eq!(entry_size("k", "\u{1F600}"), 6);
  }

  #[test]
  fn test_stored_at_reads_envelope() {
    let raw = Envelope::new(42, vec![1, 2, 3]).to_json().unwrap();
    assert_eq!(stored_at(&raw), Some(42));
    assert_eq!(stored_at(r#"{"timestamp": 42}"#), None);
    assert_eq!(stored_at("not json"), None);
  }

  #[test]
  fn test_check_quota_accounts_for_replaced_value() {
    // 10 bytes used, 6 of them by the value being replaced
    assert!(check_quota("k", "v", 6, 10, Some(8)).is_ok());
    let err = check_quota("k", "vvvv", 0, 10, Some(12)).unwrap_err();
    assert!(err.is_quota_exceeded());
    assert!(check_quota("k", "anything", 0, u64::MAX, None).is_ok());
  }
}
