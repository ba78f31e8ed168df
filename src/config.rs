use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::history::HistoryConfig;
use crate::storage::GuardConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub guard: GuardConfig,
  pub cache: CacheConfig,
  pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/stowage/storage.db)
  pub path: Option<PathBuf>,
  /// Hard limit the database refuses to grow past
  pub quota_bytes: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      quota_bytes: 5 * 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_ms: u64,
  pub stale_time_ms: u64,
  pub dedup_window_ms: u64,
  /// Timeout applied by the HTTP fetcher
  pub request_timeout_ms: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5 * 60 * 1000,
      stale_time_ms: 60 * 1000,
      dedup_window_ms: 30 * 1000,
      request_timeout_ms: Some(30 * 1000),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn stale_time(&self) -> Duration {
    Duration::from_millis(self.stale_time_ms)
  }

  pub fn dedup_window(&self) -> Duration {
    Duration::from_millis(self.dedup_window_ms)
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.request_timeout_ms.map(Duration::from_millis)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stowage.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stowage/config.yaml
  ///
  /// With no file anywhere the defaults are used. `STOWAGE_DB` and
  /// `STOWAGE_REMOTE_URL` override the file.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    config.normalize();
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stowage.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stowage").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
    if let Some(db) = var("STOWAGE_DB").filter(|v| !v.is_empty()) {
      self.storage.path = Some(PathBuf::from(db));
    }
    if let Some(url) = var("STOWAGE_REMOTE_URL").filter(|v| !v.is_empty()) {
      self.history.remote.url = Some(url);
    }
  }

  /// The guard has to recognise the keys history writes.
  fn normalize(&mut self) {
    self.guard.history_prefix = self.history.key_prefix.clone();
    if !self
      .guard
      .essential_keys
      .iter()
      .any(|k| k == &self.history.user_id_key)
    {
      self.guard.essential_keys.push(self.history.user_id_key.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let file = write_config(
      "cache:\n  default_ttl_ms: 1000\nguard:\n  max_storage_bytes: 2048\nhistory:\n  remote:\n    url: https://example.com/api/history\n",
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.cache.default_ttl(), Duration::from_secs(1));
    assert_eq!(config.cache.dedup_window(), Duration::from_secs(30));
    assert_eq!(config.guard.max_storage_bytes, 2048);
    assert_eq!(config.guard.emergency_keep, 3);
    assert_eq!(config.history.max_items, 15);
    assert_eq!(config.history.remote.max_retries, 2);
    assert_eq!(config.storage.quota_bytes, 5 * 1024 * 1024);
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/stowage.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    let file = write_config("cache: [not, a, map");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_env_overrides() {
    let vars: HashMap<&str, &str> = [
      ("STOWAGE_DB", "/tmp/other.db"),
      ("STOWAGE_REMOTE_URL", "https://example.com/save"),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/other.db")));
    assert_eq!(
      config.history.remote.url.as_deref(),
      Some("https://example.com/save")
    );

    let mut untouched = Config::default();
    untouched.apply_overrides(|_| Some(String::new()));
    assert!(untouched.storage.path.is_none());
  }

  #[test]
  fn test_history_keys_are_known_to_the_guard() {
    let file = write_config("history:\n  key_prefix: log\n  user_id_key: whoami\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.guard.history_prefix, "log");
    assert!(config.guard.essential_keys.contains(&"whoami".to_string()));
    assert!(config
      .guard
      .essential_keys
      .contains(&"user_preferences".to_string()));
  }
}
