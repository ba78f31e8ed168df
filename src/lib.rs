//! Client-side data plumbing for a process with a small storage budget.
//!
//! - [`cache`]: request deduplication and stale-while-revalidate caching
//! - [`storage`]: quota-bounded key/value stores and tiered eviction
//! - [`history`]: user-scoped history with a remote fallback
//! - [`query`]: cached API reads with loading and error state

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod query;
pub mod storage;
