//! SQLite storage backend.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::adapter::{check_quota, entry_size, StorageAdapter};
use crate::error::StorageError;

/// Durable [`StorageAdapter`] backed by a single SQLite table.
///
/// Enforces a hard quota measured the same way as the guard's budget, so
/// the process sees the same "quota exceeded" behaviour a browser would
/// produce.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota: Option<u64>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>, quota: Option<u64>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
      }
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
      quota,
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stowage").join("storage.db"))
  }

  /// Run database migrations for the key/value table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for the key/value table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    -- UTF-16 size charged against the quota
    size INTEGER NOT NULL
);
"#;

impl StorageAdapter for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;

    let used: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM kv", [], |row| {
      row.get(0)
    })?;
    let existing: Option<i64> = conn
      .query_row("SELECT size FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;

    check_quota(
      key,
      value,
      existing.unwrap_or(0).max(0) as u64,
      used.max(0) as u64,
      self.quota,
    )?;

    let size = i64::try_from(entry_size(key, value)).unwrap_or(i64::MAX);
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value, size) VALUES (?, ?, ?)",
      params![key, value, size],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    self
      .lock()?
      .execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn clear(&self) -> Result<(), StorageError> {
    self.lock()?.execute("DELETE FROM kv", [])?;
    Ok(())
  }
}
