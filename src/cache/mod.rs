//! In-memory request caching.
//!
//! This module provides a transport-agnostic request cache that:
//! - Caches fetched values with a per-entry ttl and lazy expiry
//! - Coalesces concurrent requests for the same key into one fetch
//! - Serves stale values while refreshing them in the background
//! - Reports background refresh outcomes on an event stream

mod entry;
mod fetch;
mod request;

pub use entry::{cache_key, CacheEntry, CacheEvent, CacheStats, DedupeOptions};
pub use fetch::{Fetcher, HttpFetcher};
pub use request::RequestCache;
