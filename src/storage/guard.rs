//! Storage budget enforcement and tiered eviction.
//!
//! The guard knows the total budget, classifies every key, and frees space
//! in escalating tiers:
//!
//! 1. trim history partitions to their newest items and drop aged-out values
//! 2. delete cache keys wholesale
//! 3. emergency: cut history to a handful of items and drop anything large
//! 4. wipe everything that is not essential
//!
//! Separately, [`StorageGuard::clear_now`] is a once-per-guard sweep meant
//! for startup: trim history, drop caches and anything older than a day.
//!
//! Essential keys are never selected at any tier.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::adapter::{entry_size, stored_at, Envelope, StorageAdapter};
use crate::clock::{duration_ms, SharedClock};

/// Age past which the startup sweep drops enveloped values.
const CLEAR_NOW_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Eviction policy knobs. All thresholds are fractions of `max_storage_bytes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
  /// Budget the guard keeps usage under.
  pub max_storage_bytes: u64,
  /// Usage above which init trims proactively.
  pub proactive_threshold: f64,
  /// Usage above which init cleans aggressively.
  pub warning_threshold: f64,
  /// Usage above which init falls through to emergency cleanup.
  pub critical_threshold: f64,
  /// A write that would push usage past this fraction cleans up first.
  pub write_headroom: f64,
  /// Age after which enveloped values may be dropped.
  pub max_item_age_ms: u64,
  /// Values longer than this many UTF-16 units are dropped by emergency
  /// cleanup.
  pub large_item_units: u64,
  /// Exact names or prefixes of keys that are never evicted.
  pub essential_keys: Vec<String>,
  /// Substrings marking keys that can be deleted wholesale.
  pub cache_keys: Vec<String>,
  /// Prefix of history partition keys.
  pub history_prefix: String,
  pub proactive_keep: usize,
  pub aggressive_keep: usize,
  pub emergency_keep: usize,
}

impl Default for GuardConfig {
  fn default() -> Self {
    Self {
      max_storage_bytes: 4 * 1024 * 1024,
      proactive_threshold: 0.6,
      warning_threshold: 0.8,
      critical_threshold: 0.9,
      write_headroom: 0.95,
      max_item_age_ms: 7 * 24 * 60 * 60 * 1000,
      large_item_units: 100_000,
      essential_keys: vec![
        "user_preferences".into(),
        "theme".into(),
        "sidebar_state".into(),
        "current_user_id".into(),
      ],
      cache_keys: vec![
        "_cache".into(),
        "cache_".into(),
        "saved_websites".into(),
        "form_data_".into(),
        "autofill_".into(),
      ],
      history_prefix: "history".into(),
      proactive_keep: 10,
      aggressive_keep: 5,
      emergency_keep: 3,
    }
  }
}

/// How a key is treated by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
  /// Never evicted.
  Essential,
  /// Deleted wholesale under pressure.
  Cache,
  /// A history partition; trimmed, not deleted.
  History,
  Other,
}

/// A derived view of one stored key.
#[derive(Debug, Clone, Serialize)]
pub struct StorageItem {
  pub key: String,
  pub size: u64,
  /// `storedAt` of the value, when it is enveloped.
  pub timestamp: Option<i64>,
  pub class: KeyClass,
  pub is_cache: bool,
}

/// Approximate usage against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
  pub used: u64,
  pub total: u64,
  /// `used / total` as a fraction.
  pub percentage: f64,
}

/// The escalating cleanup strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTier {
  Proactive,
  Aggressive,
  Emergency,
  Wipe,
}

/// What a cleanup pass freed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
  pub bytes_freed: u64,
  pub keys_removed: usize,
  pub keys_trimmed: usize,
}

impl CleanupReport {
  fn absorb(&mut self, other: CleanupReport) {
    self.bytes_freed += other.bytes_freed;
    self.keys_removed += other.keys_removed;
    self.keys_trimmed += other.keys_trimmed;
  }
}

/// Budget-aware wrapper around a [`StorageAdapter`].
pub struct StorageGuard<S: StorageAdapter> {
  storage: Arc<S>,
  clock: SharedClock,
  config: Arc<GuardConfig>,
  initialized: Arc<AtomicBool>,
  cleared_now: Arc<AtomicBool>,
}

impl<S: StorageAdapter> StorageGuard<S> {
  pub fn new(storage: S, clock: SharedClock, config: GuardConfig) -> Self {
    Self::from_shared(Arc::new(storage), clock, config)
  }

  pub fn from_shared(storage: Arc<S>, clock: SharedClock, config: GuardConfig) -> Self {
    Self {
      storage,
      clock,
      config: Arc::new(config),
      initialized: Arc::new(AtomicBool::new(false)),
      cleared_now: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn clock(&self) -> &SharedClock {
    &self.clock
  }

  pub fn config(&self) -> &GuardConfig {
    &self.config
  }

  /// Classify a key. Essential wins over every other match.
  pub fn classify(&self, key: &str) -> KeyClass {
    if self
      .config
      .essential_keys
      .iter()
      .any(|k| key == k || key.starts_with(k.as_str()))
    {
      KeyClass::Essential
    } else if key.starts_with(self.config.history_prefix.as_str()) {
      KeyClass::History
    } else if self
      .config
      .cache_keys
      .iter()
      .any(|k| key.contains(k.as_str()))
    {
      KeyClass::Cache
    } else {
      KeyClass::Other
    }
  }

  pub fn is_essential(&self, key: &str) -> bool {
    self.classify(key) == KeyClass::Essential
  }

  /// Every stored key with its value. Read failures are logged and skipped.
  fn scan(&self) -> Vec<(String, String)> {
    let keys = match self.storage.keys() {
      Ok(keys) => keys,
      Err(e) => {
        error!("Failed to list storage keys: {}", e);
        return Vec::new();
      }
    };

    keys
      .into_iter()
      .filter_map(|key| match self.storage.get(&key) {
        Ok(Some(value)) => Some((key, value)),
        Ok(None) => None,
        Err(e) => {
          warn!("Failed to read {}: {}", key, e);
          None
        }
      })
      .collect()
  }

  /// Approximate usage against the configured budget.
  pub fn usage(&self) -> StorageUsage {
    let used: u64 = self.scan().iter().map(|(k, v)| entry_size(k, v)).sum();
    let total = self.config.max_storage_bytes;
    let percentage = if total == 0 {
      1.0
    } else {
      used as f64 / total as f64
    };
    StorageUsage {
      used,
      total,
      percentage,
    }
  }

  /// Every key, classified, largest first.
  pub fn items(&self) -> Vec<StorageItem> {
    let mut items: Vec<StorageItem> = self
      .scan()
      .into_iter()
      .map(|(key, value)| {
        let class = self.classify(&key);
        StorageItem {
          size: entry_size(&key, &value),
          timestamp: stored_at(&value),
          is_cache: class == KeyClass::Cache,
          class,
          key,
        }
      })
      .collect();
    items.sort_by(|a, b| b.size.cmp(&a.size));
    items
  }

  fn remove_all(&self, victims: Vec<(String, u64)>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for (key, size) in victims {
      match self.storage.remove(&key) {
        Ok(()) => {
          report.bytes_freed += size;
          report.keys_removed += 1;
        }
        Err(e) => warn!("Failed to remove {}: {}", key, e),
      }
    }
    report
  }

  /// Delete every cache key. Returns bytes freed.
  pub fn clear_cache_data(&self) -> u64 {
    self.clear_cache_report().bytes_freed
  }

  fn clear_cache_report(&self) -> CleanupReport {
    let victims: Vec<(String, u64)> = self
      .scan()
      .into_iter()
      .filter(|(key, _)| self.classify(key) == KeyClass::Cache)
      .map(|(key, value)| {
        let size = entry_size(&key, &value);
        (key, size)
      })
      .collect();

    let report = self.remove_all(victims);
    info!(
      "Cleared {} cache items ({:.1} KB)",
      report.keys_removed,
      report.bytes_freed as f64 / 1024.0
    );
    report
  }

  /// Delete enveloped values older than `max_age`.
  ///
  /// History partitions are trimmed, never aged out, and values without an
  /// envelope have no known age so they are kept.
  pub fn clear_old_data(&self, max_age: Duration) -> u64 {
    self.clear_old_report(max_age).bytes_freed
  }

  fn clear_old_report(&self, max_age: Duration) -> CleanupReport {
    let now = self.clock.now_ms();
    let max_age = duration_ms(max_age);

    let victims: Vec<(String, u64)> = self
      .scan()
      .into_iter()
      .filter(|(key, _)| matches!(self.classify(key), KeyClass::Cache | KeyClass::Other))
      .filter_map(|(key, value)| {
        let ts = stored_at(&value)?;
        (now.saturating_sub(ts) > max_age).then(|| {
          let size = entry_size(&key, &value);
          (key, size)
        })
      })
      .collect();

    let report = self.remove_all(victims);
    if report.keys_removed > 0 {
      info!(
        "Cleared {} old items ({:.1} KB)",
        report.keys_removed,
        report.bytes_freed as f64 / 1024.0
      );
    }
    report
  }

  fn default_max_age(&self) -> Duration {
    Duration::from_millis(self.config.max_item_age_ms)
  }

  /// Wipe everything except essential keys, whose values are restored.
  pub fn clear_all_storage(&self) -> CleanupReport {
    let entries = self.scan();
    let used: u64 = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    let (essential, rest): (Vec<_>, Vec<_>) = entries
      .into_iter()
      .partition(|(key, _)| self.is_essential(key));

    if let Err(e) = self.storage.clear() {
      error!("Failed to clear storage: {}", e);
      return CleanupReport::default();
    }

    let mut kept = 0;
    for (key, value) in &essential {
      match self.storage.set(key, value) {
        Ok(()) => kept += entry_size(key, value),
        Err(e) => error!("Failed to restore essential key {}: {}", key, e),
      }
    }

    info!("Cleared all non-essential storage");
    CleanupReport {
      bytes_freed: used.saturating_sub(kept),
      keys_removed: rest.len(),
      keys_trimmed: 0,
    }
  }

  /// Read a value, treating backend failures as absent.
  pub fn safe_get_item(&self, key: &str) -> Option<String> {
    match self.storage.get(key) {
      Ok(value) => value,
      Err(e) => {
        error!("Error reading {}: {}", key, e);
        None
      }
    }
  }

  /// Write a value, cleaning up first if it would crowd the budget and once
  /// more if the store reports its quota exceeded.
  ///
  /// Returns `false` only when the write could not be made.
  pub fn safe_set_item(&self, key: &str, value: &str) -> bool {
    let item_size = entry_size(key, value);
    let usage = self.usage();

    if (usage.used + item_size) as f64 > usage.total as f64 * self.config.write_headroom {
      warn!("Storage near limit, clearing old data before writing {}", key);
      self.clear_old_data(self.default_max_age());
      self.clear_cache_data();
    }

    match self.storage.set(key, value) {
      Ok(()) => true,
      Err(e) if e.is_quota_exceeded() => {
        warn!("Quota exceeded writing {}, clearing cache", key);
        self.clear_cache_data();
        self.clear_old_data(self.default_max_age());

        match self.storage.set(key, value) {
          Ok(()) => true,
          Err(e) => {
            error!("Still cannot save {} after cleanup: {}", key, e);
            false
          }
        }
      }
      Err(e) => {
        error!("Error saving {}: {}", key, e);
        false
      }
    }
  }

  /// Envelope `payload` with the current time and write it safely.
  pub fn store<T: Serialize>(&self, key: &str, payload: &T) -> bool {
    match Envelope::new(self.clock.now_ms(), payload).to_json() {
      Ok(raw) => self.safe_set_item(key, &raw),
      Err(e) => {
        error!("Failed to serialize {}: {}", key, e);
        false
      }
    }
  }

  /// Trim every history partition to its `keep` newest items.
  pub fn trim_history(&self, keep: usize) -> u64 {
    self.trim_history_keys(keep, false).bytes_freed
  }

  fn trim_history_keys(&self, keep: usize, remove_unreadable: bool) -> CleanupReport {
    let mut report = CleanupReport::default();

    for (key, value) in self.scan() {
      if self.classify(&key) != KeyClass::History {
        continue;
      }

      let mut history = match serde_json::from_str::<Envelope<Vec<Value>>>(&value) {
        Ok(envelope) => envelope.payload,
        Err(_) if remove_unreadable => {
          report.absorb(self.remove_all(vec![(key.clone(), entry_size(&key, &value))]));
          continue;
        }
        Err(_) => continue,
      };
      if history.len() <= keep {
        continue;
      }

      let before = history.len();
      history.sort_by_key(|item| std::cmp::Reverse(item_timestamp(item)));
      history.truncate(keep);

      let trimmed = match Envelope::new(self.clock.now_ms(), &history).to_json() {
        Ok(raw) => raw,
        Err(e) => {
          warn!("Failed to serialize trimmed history {}: {}", key, e);
          continue;
        }
      };
      match self.storage.set(&key, &trimmed) {
        Ok(()) => {
          report.bytes_freed += entry_size(&key, &value).saturating_sub(entry_size(&key, &trimmed));
          report.keys_trimmed += 1;
          info!("Trimmed history {} from {} to {} items", key, before, keep);
        }
        Err(e) => warn!("Failed to write trimmed history {}: {}", key, e),
      }
    }

    report
  }

  /// The most aggressive tier short of a wipe.
  ///
  /// Cuts every history partition to its newest few items (unreadable ones
  /// are removed) and drops every non-essential value over the size limit.
  pub fn emergency_cleanup(&self) -> CleanupReport {
    let mut report = self.trim_history_keys(self.config.emergency_keep, true);

    let victims: Vec<(String, u64)> = self
      .scan()
      .into_iter()
      .filter(|(key, value)| {
        value.encode_utf16().count() as u64 > self.config.large_item_units
          && !self.is_essential(key)
      })
      .map(|(key, value)| {
        let size = entry_size(&key, &value);
        (key, size)
      })
      .collect();
    report.absorb(self.remove_all(victims));

    info!(
      "Emergency cleanup completed, freed {:.1} KB",
      report.bytes_freed as f64 / 1024.0
    );
    report
  }

  /// Run one eviction tier.
  pub fn evict(&self, tier: EvictionTier) -> CleanupReport {
    let (keep, tier_name) = match tier {
      EvictionTier::Proactive => (self.config.proactive_keep, "proactive"),
      EvictionTier::Aggressive => (self.config.aggressive_keep, "aggressive"),
      EvictionTier::Emergency => return self.emergency_cleanup(),
      EvictionTier::Wipe => return self.clear_all_storage(),
    };

    debug!("Running {} cleanup", tier_name);
    let mut report = self.trim_history_keys(keep, false);
    report.absorb(self.clear_cache_report());
    report.absorb(self.clear_old_report(self.default_max_age()));
    report
  }

  /// Check usage once per guard and clean up by threshold.
  ///
  /// A store that cannot even list its keys gets emergency cleanup.
  ///
  /// Returns `None` when it already ran, otherwise what was freed.
  pub fn init(&self) -> Option<CleanupReport> {
    if self.initialized.swap(true, Ordering::SeqCst) {
      return None;
    }

    if let Err(e) = self.storage.keys() {
      error!("Cannot inspect storage ({}), emergency cleanup", e);
      return Some(self.emergency_cleanup());
    }

    let usage = self.usage();
    info!(
      "Storage: {:.1} KB / {:.0} KB ({:.1}%)",
      usage.used as f64 / 1024.0,
      usage.total as f64 / 1024.0,
      usage.percentage * 100.0
    );

    let mut report = CleanupReport::default();
    if usage.percentage > self.config.proactive_threshold {
      warn!("Storage above {:.0}%, proactive cleanup", self.config.proactive_threshold * 100.0);
      report.absorb(self.evict(EvictionTier::Proactive));
    }

    if usage.percentage > self.config.warning_threshold {
      warn!("Storage above warning threshold, aggressive cleanup");
      report.absorb(self.evict(EvictionTier::Aggressive));

      if self.usage().percentage > self.config.critical_threshold {
        warn!("Critical storage level, emergency cleanup");
        report.absorb(self.emergency_cleanup());
      }
    }

    Some(report)
  }

  /// Immediate cleanup, once per guard: trim history to the proactive
  /// keep-count, drop cache keys, then drop values older than a day.
  ///
  /// Returns `None` when it already ran.
  pub fn clear_now(&self) -> Option<CleanupReport> {
    if self.cleared_now.swap(true, Ordering::SeqCst) {
      return None;
    }

    info!("Performing immediate storage cleanup");
    let mut report = self.trim_history_keys(self.config.proactive_keep, false);
    report.absorb(self.clear_cache_report());
    report.absorb(self.clear_old_report(CLEAR_NOW_MAX_AGE));

    info!(
      "After cleanup: {:.1} KB used",
      self.usage().used as f64 / 1024.0
    );
    Some(report)
  }
}

impl<S: StorageAdapter> Clone for StorageGuard<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      config: Arc::clone(&self.config),
      initialized: Arc::clone(&self.initialized),
      cleared_now: Arc::clone(&self.cleared_now),
    }
  }
}

/// Millisecond timestamp of a history entry, 0 when missing or unparseable.
fn item_timestamp(item: &Value) -> i64 {
  item
    .get("timestamp")
    .and_then(Value::as_str)
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map_or(0, |dt| dt.timestamp_millis())
}
