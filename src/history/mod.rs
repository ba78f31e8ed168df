//! Durable, user-scoped history.
//!
//! Items are kept per user under `{prefix}-{user}` keys. Writes make room
//! through the [`StorageGuard`](crate::storage::StorageGuard) first and, when
//! local storage cannot take an item at all, hand it to a [`RemoteSink`] and
//! keep a lightweight reference locally.

mod item;
mod remote;
mod store;

pub use item::{HistoryItem, HistoryStatus};
pub use remote::{DisabledSink, HttpRemoteSink, RemoteConfig, RemoteSink};
pub use store::{HistoryConfig, HistoryStore, UpdateOutcome};
