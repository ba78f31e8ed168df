//! User-scoped history log on top of a [`StorageGuard`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::item::{HistoryItem, HistoryStatus};
use super::remote::{RemoteConfig, RemoteSink};
use crate::error::{HistoryError, StorageError};
use crate::storage::{Envelope, StorageAdapter, StorageGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
  /// Partition keys are `{key_prefix}-{user}`, or `{key_prefix}` with no user
  pub key_prefix: String,
  /// Where the current user id is persisted
  pub user_id_key: String,
  /// A partition above this many items is trimmed by five on save
  pub max_items: usize,
  /// Usage fraction above which save trims before writing
  pub proactive_save_threshold: f64,
  /// Type given to items created by an `update` of an unknown id
  pub default_item_type: String,
  pub remote: RemoteConfig,
}

impl Default for HistoryConfig {
  fn default() -> Self {
    Self {
      key_prefix: "history".into(),
      user_id_key: "current_user_id".into(),
      max_items: 15,
      proactive_save_threshold: 0.7,
      default_item_type: "item".into(),
      remote: RemoteConfig::default(),
    }
  }
}

/// Whether an `update` touched an existing item or created one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Updated,
  Created,
}

/// Durable, per-user append log of [`HistoryItem`]s.
///
/// Each user's items live under their own key so nothing written for one
/// user is readable by another. Saves degrade from local storage to the
/// remote sink, keeping only a small reference locally.
pub struct HistoryStore<S: StorageAdapter> {
  guard: StorageGuard<S>,
  remote: Arc<dyn RemoteSink>,
  config: Arc<HistoryConfig>,
  current_user: Arc<RwLock<Option<String>>>,
}

impl<S: StorageAdapter> HistoryStore<S> {
  /// Create a store, resuming whichever user was last set.
  pub fn new(guard: StorageGuard<S>, remote: Arc<dyn RemoteSink>, config: HistoryConfig) -> Self {
    let current_user = guard
      .safe_get_item(&config.user_id_key)
      .and_then(|raw| serde_json::from_str::<Envelope<String>>(&raw).ok())
      .map(|envelope| envelope.payload);
    if let Some(user) = &current_user {
      debug!("Resuming history for user {}", user);
    }

    Self {
      guard,
      remote,
      config: Arc::new(config),
      current_user: Arc::new(RwLock::new(current_user)),
    }
  }

  pub fn guard(&self) -> &StorageGuard<S> {
    &self.guard
  }

  pub fn current_user_id(&self) -> Option<String> {
    self
      .current_user
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn shared_key(&self) -> String {
    self.config.key_prefix.clone()
  }

  fn user_key(&self, user: &str) -> String {
    format!("{}-{}", self.config.key_prefix, user)
  }

  /// The partition key of the current user.
  pub fn storage_key(&self) -> String {
    match self.current_user_id() {
      Some(user) => self.user_key(&user),
      None => self.shared_key(),
    }
  }

  /// Switch the active partition.
  ///
  /// When a known user is replaced, anything left in the shared partition is
  /// folded into that previous user's partition, never the new one.
  pub fn set_current_user_id(&self, user: Option<&str>) {
    let previous = {
      let mut current = self
        .current_user
        .write()
        .unwrap_or_else(PoisonError::into_inner);
      std::mem::replace(&mut *current, user.map(str::to_string))
    };

    match user {
      Some(id) => {
        if !self.guard.store(&self.config.user_id_key, &id) {
          warn!("Could not persist current user id");
        }
      }
      None => {
        if let Err(e) = self.guard.storage().remove(&self.config.user_id_key) {
          warn!("Could not forget current user id: {}", e);
        }
      }
    }

    match previous {
      Some(prev) if Some(prev.as_str()) != user => self.migrate_shared(&prev),
      _ => {}
    }
  }

  fn migrate_shared(&self, owner: &str) {
    let shared_key = self.shared_key();
    let shared = self.items_in(&shared_key);
    if shared.is_empty() {
      return;
    }

    let target_key = self.user_key(owner);
    let mut target = self.items_in(&target_key);
    let before = target.len();
    for item in shared {
      if !target.iter().any(|t| t.id == item.id) {
        target.push(item);
      }
    }

    match self.persist(&target_key, &target) {
      Ok(()) => {
        info!(
          "Moved {} shared history items to {}",
          target.len() - before,
          target_key
        );
        if let Err(e) = self.guard.storage().remove(&shared_key) {
          warn!("Failed to remove shared history: {}", e);
        }
      }
      Err(e) => error!("Failed to migrate shared history to {}: {}", target_key, e),
    }
  }

  fn items_in(&self, key: &str) -> Vec<HistoryItem> {
    let Some(raw) = self.guard.safe_get_item(key) else {
      return Vec::new();
    };
    match serde_json::from_str::<Envelope<Vec<HistoryItem>>>(&raw) {
      Ok(envelope) => envelope.payload,
      Err(e) => {
        error!("Unreadable history under {}: {}", key, e);
        Vec::new()
      }
    }
  }

  fn write_partition(&self, key: &str, items: &[HistoryItem]) -> Result<(), StorageError> {
    let raw = Envelope::new(self.guard.clock().now_ms(), items)
      .to_json()
      .map_err(|e| StorageError::Backend(format!("Failed to serialize history: {}", e)))?;
    self.guard.storage().set(key, &raw)
  }

  /// Write a partition, giving it one more chance after emergency cleanup.
  fn persist(&self, key: &str, items: &[HistoryItem]) -> Result<(), StorageError> {
    match self.write_partition(key, items) {
      Err(e) if e.is_quota_exceeded() => {
        warn!("Quota exceeded writing {}, emergency cleanup", key);
        self.guard.emergency_cleanup();
        self.write_partition(key, items)
      }
      other => other,
    }
  }

  /// Free space ahead of a save when usage is already high.
  fn make_room(&self, key: &str) {
    let threshold = self.config.proactive_save_threshold;
    if self.guard.usage().percentage <= threshold {
      return;
    }

    warn!("Storage above {:.0}% before save, trimming {}", threshold * 100.0, key);
    self.cleanup_in(key, self.config.max_items.saturating_sub(5));
    if self.guard.usage().percentage > threshold {
      self.guard.emergency_cleanup();
    }
  }

  /// Record a new item.
  ///
  /// Falls back to the remote sink when the item cannot be stored locally;
  /// the returned item is then the local reference. Errors only when both
  /// local storage and the remote sink fail.
  pub async fn save(
    &self,
    item_type: &str,
    name: &str,
    data: Value,
    status: HistoryStatus,
  ) -> Result<HistoryItem, HistoryError> {
    let key = self.storage_key();
    let item = HistoryItem::new(
      Uuid::new_v4().to_string(),
      item_type,
      name,
      data,
      status,
      self.guard.clock().now(),
    );

    self.make_room(&key);

    let mut items = self.items_in(&key);
    if items.len() > self.config.max_items {
      keep_newest(&mut items, self.config.max_items.saturating_sub(5));
    }
    items.push(item.clone());

    let local = match self.write_partition(&key, &items) {
      Err(e) if e.is_quota_exceeded() => {
        warn!("Quota exceeded saving {}, emergency cleanup", item.id);
        self.guard.emergency_cleanup();
        let mut items = self.items_in(&key);
        keep_newest(&mut items, self.guard.config().aggressive_keep);
        items.push(item.clone());
        self.write_partition(&key, &items)
      }
      other => other,
    };

    match local {
      Ok(()) => {
        debug!("Saved history item {} under {}", item.id, key);
        return Ok(item);
      }
      Err(e) => warn!("Cannot save {} locally ({}), using remote", item.id, e),
    }

    let remote_id = self.remote.upload(&item).await?;
    let reference = item.reference(&remote_id);

    // the key is re-read: the upload may have taken a while
    let mut items = self.items_in(&key);
    items.retain(|i| i.id != reference.id);
    items.push(reference.clone());
    if let Err(e) = self.write_partition(&key, &items) {
      warn!("Could not keep local reference to {}: {}", reference.id, e);
    }

    Ok(reference)
  }

  /// Replace an item's payload, or create a draft when `id` is unknown.
  pub fn update(
    &self,
    id: &str,
    data: Value,
    name: Option<&str>,
  ) -> Result<UpdateOutcome, HistoryError> {
    let key = self.storage_key();
    let mut items = self.items_in(&key);
    let now = self.guard.clock().now();

    let outcome = match items.iter_mut().find(|i| i.id == id) {
      Some(item) => {
        item.revise(data, name, now);
        UpdateOutcome::Updated
      }
      None => {
        items.push(HistoryItem::new(
          id,
          self.config.default_item_type.as_str(),
          name.unwrap_or("Draft"),
          data,
          HistoryStatus::Draft,
          now,
        ));
        UpdateOutcome::Created
      }
    };

    self.persist(&key, &items)?;
    Ok(outcome)
  }

  /// Mark an item completed. Returns `false` when there is no such item.
  pub fn mark_as_completed(&self, id: &str) -> Result<bool, HistoryError> {
    let key = self.storage_key();
    let mut items = self.items_in(&key);
    let Some(item) = items.iter_mut().find(|i| i.id == id) else {
      return Ok(false);
    };
    if item.is_completed() {
      return Ok(true);
    }

    item.complete(self.guard.clock().now());
    self.persist(&key, &items)?;
    Ok(true)
  }

  /// Remove an item. Returns `false` when there is no such item.
  pub fn delete(&self, id: &str) -> Result<bool, HistoryError> {
    let key = self.storage_key();
    let mut items = self.items_in(&key);
    let before = items.len();
    items.retain(|i| i.id != id);
    if items.len() == before {
      return Ok(false);
    }

    self.persist(&key, &items)?;
    Ok(true)
  }

  /// Every item of the current user, in insertion order.
  pub fn get_all(&self) -> Vec<HistoryItem> {
    self.items_in(&self.storage_key())
  }

  pub fn get_by_type(&self, item_type: &str) -> Vec<HistoryItem> {
    let mut items = self.get_all();
    items.retain(|i| i.item_type == item_type);
    items
  }

  /// Drop the current user's partition.
  pub fn clear(&self) -> Result<(), HistoryError> {
    self.guard.storage().remove(&self.storage_key())?;
    Ok(())
  }

  /// Keep only the `keep` newest items. Returns how many were dropped.
  pub fn cleanup_old_items(&self, keep: usize) -> usize {
    self.cleanup_in(&self.storage_key(), keep)
  }

  fn cleanup_in(&self, key: &str, keep: usize) -> usize {
    let mut items = self.items_in(key);
    if items.len() <= keep {
      return 0;
    }

    let removed = keep_newest(&mut items, keep);
    match self.persist(key, &items) {
      Ok(()) => {
        info!("Removed {} old history items from {}", removed, key);
        removed
      }
      Err(e) => {
        error!("Failed to clean up {}: {}", key, e);
        0
      }
    }
  }
}

impl<S: StorageAdapter> Clone for HistoryStore<S> {
  fn clone(&self) -> Self {
    Self {
      guard: self.guard.clone(),
      remote: Arc::clone(&self.remote),
      config: Arc::clone(&self.config),
      current_user: Arc::clone(&self.current_user),
    }
  }
}

/// Sort oldest first and drop all but the `keep` newest. Returns the number dropped.
fn keep_newest(items: &mut Vec<HistoryItem>, keep: usize) -> usize {
  if items.len() <= keep {
    return 0;
  }
  items.sort_by_key(|i| i.timestamp);
  let drop = items.len() - keep;
  items.drain(..drop);
  drop
}
