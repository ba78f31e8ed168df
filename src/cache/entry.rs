//! Core types for the request cache.

use std::time::Duration;

/// A cached fetch result.
///
/// Replaced wholesale on every refresh, never mutated in place.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  /// The cached value
  pub data: V,
  /// When the value was stored (ms since epoch)
  pub timestamp: i64,
  /// When the value stops being visible (ms since epoch)
  pub expires_at: i64,
}

impl<V> CacheEntry<V> {
  /// Whether the entry may still be served at `now`.
  pub fn is_live(&self, now: i64) -> bool {
    now < self.expires_at
  }

  /// Age of the entry at `now`, in milliseconds.
  pub fn age_ms(&self, now: i64) -> i64 {
    now.saturating_sub(self.timestamp)
  }
}

/// Options for [`RequestCache::dedupe`](super::RequestCache::dedupe).
#[derive(Debug, Clone, Copy)]
pub struct DedupeOptions {
  /// Lifetime of the stored result; the cache default when `None`.
  pub ttl: Option<Duration>,
  /// Serve cached data immediately and refresh it in the background once
  /// it is older than `stale_time`.
  pub stale_while_revalidate: bool,
  pub stale_time: Duration,
}

impl Default for DedupeOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      stale_while_revalidate: false,
      stale_time: Duration::from_secs(60),
    }
  }
}

/// Counts of cached values and in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub cache_size: usize,
  pub pending_requests: usize,
}

/// Outcome of a background revalidation.
///
/// Background refreshes never report to the caller that was served stale
/// data; they report here instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// The key was refreshed with new data.
  Revalidated { key: String },
  /// The refresh failed; the stale value stays cached.
  RevalidationFailed { key: String, error: String },
}

/// Build a cache key from parts, e.g. `cache_key(&["api", "/users/1"])`.
pub fn cache_key(parts: &[&str]) -> String {
  parts.join(":")
}
