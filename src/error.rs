//! Error types for the storage, cache and history layers.
//!
//! Quota exhaustion is an explicit [`StorageError::QuotaExceeded`] variant so
//! eviction and retry are ordinary branches on a `Result`.

use thiserror::Error;

/// A failed network fetch.
///
/// `Clone` because one failed in-flight request is delivered to every caller
/// that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The server answered with a non-2xx status.
  #[error("HTTP {status}: {reason}")]
  Status { status: u16, reason: String },

  /// The request never produced a response (DNS, connect, TLS, reset).
  #[error("request failed: {0}")]
  Transport(String),

  /// The body was not the JSON we expected.
  #[error("invalid response body: {0}")]
  Decode(String),

  /// The fetch task went away before settling.
  #[error("fetch aborted: {0}")]
  Aborted(String),

  /// Any other fetcher-defined failure.
  #[error("{0}")]
  Other(String),
}

impl FetchError {
  /// Whether the request is worth repeating.
  ///
  /// 429 is never retried so a rate-limited client backs off instead of
  /// hammering the server.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Status { status, .. } => *status >= 500,
      Self::Transport(_) => true,
      _ => false,
    }
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      Self::Decode(e.to_string())
    } else if let Some(status) = e.status() {
      Self::Status {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
      }
    } else {
      Self::Transport(e.to_string())
    }
  }
}

/// A failed operation against a [`StorageAdapter`](crate::storage::StorageAdapter).
#[derive(Debug, Error)]
pub enum StorageError {
  /// The write would take the store past its hard allotment.
  #[error("storage quota exceeded writing {key} ({requested} bytes, {available} available)")]
  QuotaExceeded {
    key: String,
    requested: u64,
    available: u64,
  },

  /// The backing store failed for another reason.
  #[error("storage backend error: {0}")]
  Backend(String),
}

impl StorageError {
  pub fn is_quota_exceeded(&self) -> bool {
    matches!(self, Self::QuotaExceeded { .. })
  }
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Backend(e.to_string())
  }
}

/// A history write that could not be completed anywhere.
#[derive(Debug, Error)]
pub enum HistoryError {
  #[error(transparent)]
  Storage(#[from] StorageError),

  /// Local persistence failed and so did the remote fallback.
  #[error("local save failed and remote fallback failed: {0}")]
  Remote(#[from] FetchError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retryable_statuses() {
    let server = FetchError::Status {
      status: 503,
      reason: "Service Unavailable".into(),
    };
    let limited = FetchError::Status {
      status: 429,
      reason: "Too Many Requests".into(),
    };
    assert!(server.is_retryable());
    assert!(!limited.is_retryable());
    assert!(FetchError::Transport("reset".into()).is_retryable());
    assert!(!FetchError::Decode("eof".into()).is_retryable());
  }

  #[test]
  fn test_quota_display() {
    let err = StorageError::QuotaExceeded {
      key: "history-a".into(),
      requested: 10,
      available: 2,
    };
    assert!(err.is_quota_exceeded());
    assert!(err.to_string().contains("history-a"));
  }
}
