//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV: &str = "STOWAGE_LOG";
const DEFAULT_FILTER: &str = "warn";

/// Filter from `STOWAGE_LOG`, falling back to warnings and errors only.
pub fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber, writing to stderr or appending to
/// `log_file`.
///
/// The returned guard flushes the file writer on drop, so keep it alive
/// for the life of the process.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let builder = tracing_subscriber::fmt().with_env_filter(env_filter());

  let Some(path) = log_file else {
    builder
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to install logger: {}", e))?;
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  let dir = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  };
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  builder
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(Some(guard))
}
