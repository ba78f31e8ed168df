use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stowage::cache::{DedupeOptions, Fetcher, HttpFetcher, RequestCache};
use stowage::clock::{SharedClock, SystemClock};
use stowage::config::Config;
use stowage::history::{
  DisabledSink, HistoryStatus, HistoryStore, HttpRemoteSink, RemoteSink, UpdateOutcome,
};
use stowage::query::query_key;
use stowage::storage::{EvictionTier, SqliteStorage, StorageAdapter, StorageGuard};

#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Quota-guarded local storage, request caching and user history")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stowage/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the storage database
  #[arg(long)]
  db: Option<PathBuf>,

  /// User whose history to work with
  #[arg(short, long)]
  user: Option<String>,

  /// Append logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show storage usage against the budget
  Usage,
  /// List stored keys, largest first
  Items,
  /// Check usage and clean up by threshold
  Init,
  /// Trim history, drop caches and anything older than a day
  ClearNow,
  /// Run one eviction tier
  Cleanup {
    #[arg(value_enum)]
    tier: Tier,
  },
  /// Fetch a URL through the request cache
  Fetch {
    url: String,
    /// Number of concurrent callers asking for the URL
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Lifetime of the cached response
    #[arg(long)]
    ttl_ms: Option<u64>,
  },
  /// Work with the user's history
  History {
    #[command(subcommand)]
    action: HistoryAction,
  },
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
  /// List items, optionally of one type
  List {
    #[arg(long = "type")]
    item_type: Option<String>,
  },
  /// Record a new item
  Save {
    item_type: String,
    name: String,
    /// Item payload as JSON
    #[arg(long, default_value = "{}")]
    data: String,
    #[arg(long)]
    completed: bool,
  },
  /// Replace an item's payload, creating a draft if it does not exist
  Update {
    id: String,
    #[arg(long, default_value = "{}")]
    data: String,
    #[arg(long)]
    name: Option<String>,
  },
  /// Mark an item completed
  Complete { id: String },
  Delete { id: String },
  /// Remove all of the user's history
  Clear,
  /// Keep only the newest items
  Prune {
    #[arg(long, default_value_t = 10)]
    keep: usize,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Tier {
  Proactive,
  Aggressive,
  Emergency,
  Wipe,
}

impl From<Tier> for EvictionTier {
  fn from(tier: Tier) -> Self {
    match tier {
      Tier::Proactive => EvictionTier::Proactive,
      Tier::Aggressive => EvictionTier::Aggressive,
      Tier::Emergency => EvictionTier::Emergency,
      Tier::Wipe => EvictionTier::Wipe,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = stowage::logging::init(args.log_file.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(db) = args.db {
    config.storage.path = Some(db);
  }

  let clock: SharedClock = Arc::new(SystemClock);
  let storage = SqliteStorage::open(
    config.storage.path.as_deref(),
    Some(config.storage.quota_bytes),
  )?;
  let guard = StorageGuard::new(storage, clock.clone(), config.guard.clone());

  match args.command {
    Command::Usage => print_json(&guard.usage()),
    Command::Items => print_json(&guard.items()),
    Command::Init => print_json(&guard.init()),
    Command::ClearNow => print_json(&guard.clear_now()),
    Command::Cleanup { tier } => print_json(&guard.evict(tier.into())),
    Command::Fetch {
      url,
      concurrency,
      ttl_ms,
    } => fetch(&config, clock, url, concurrency, ttl_ms).await,
    Command::History { action } => {
      guard.init();
      let store = HistoryStore::new(guard, remote_sink(&config)?, config.history.clone());
      if let Some(user) = args.user.as_deref() {
        store.set_current_user_id(Some(user));
      }
      run_history(&store, action).await
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_data(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("--data is not valid JSON: {}", e))
}

fn remote_sink(config: &Config) -> Result<Arc<dyn RemoteSink>> {
  Ok(match &config.history.remote.url {
    Some(url) => Arc::new(HttpRemoteSink::new(url, &config.history.remote)?),
    None => Arc::new(DisabledSink),
  })
}

/// Issue `concurrency` simultaneous reads of `url` and report how many
/// requests actually went out.
async fn fetch(
  config: &Config,
  clock: SharedClock,
  url: String,
  concurrency: usize,
  ttl_ms: Option<u64>,
) -> Result<()> {
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.cache.request_timeout())?);
  let cache: RequestCache = RequestCache::new(clock)
    .with_default_ttl(config.cache.default_ttl())
    .with_dedup_window(config.cache.dedup_window());

  let key = query_key(&url);
  let options = DedupeOptions {
    ttl: ttl_ms.map(Duration::from_millis),
    stale_while_revalidate: false,
    stale_time: config.cache.stale_time(),
  };
  let requests = Arc::new(AtomicUsize::new(0));

  let callers: Vec<_> = (0..concurrency.max(1))
    .map(|_| {
      let fetcher = Arc::clone(&fetcher);
      let requests = Arc::clone(&requests);
      let url = url.clone();
      cache.dedupe(
        &key,
        move || {
          requests.fetch_add(1, Ordering::SeqCst);
          async move { fetcher.fetch_json(&url).await }
        },
        options,
      )
    })
    .collect();

  let results = futures::future::join_all(callers).await;
  debug!("{:?}", cache.stats());

  let value = results
    .into_iter()
    .next()
    .ok_or_else(|| eyre!("No fetch was made"))??;
  print_json(&value)?;
  eprintln!(
    "{} caller(s), {} request(s)",
    concurrency.max(1),
    requests.load(Ordering::SeqCst)
  );
  Ok(())
}

async fn run_history<S: StorageAdapter>(store: &HistoryStore<S>, action: HistoryAction) -> Result<()> {
  match action {
    HistoryAction::List { item_type } => {
      let items = match item_type {
        Some(t) => store.get_by_type(&t),
        None => store.get_all(),
      };
      print_json(&items)
    }
    HistoryAction::Save {
      item_type,
      name,
      data,
      completed,
    } => {
      let status = if completed {
        HistoryStatus::Completed
      } else {
        HistoryStatus::Draft
      };
      let item = store.save(&item_type, &name, parse_data(&data)?, status).await?;
      print_json(&item)
    }
    HistoryAction::Update { id, data, name } => {
      match store.update(&id, parse_data(&data)?, name.as_deref())? {
        UpdateOutcome::Updated => println!("updated {}", id),
        UpdateOutcome::Created => println!("created {}", id),
      }
      Ok(())
    }
    HistoryAction::Complete { id } => {
      if !store.mark_as_completed(&id)? {
        return Err(eyre!("No history item {}", id));
      }
      Ok(())
    }
    HistoryAction::Delete { id } => {
      if !store.delete(&id)? {
        return Err(eyre!("No history item {}", id));
      }
      Ok(())
    }
    HistoryAction::Clear => {
      store.clear()?;
      Ok(())
    }
    HistoryAction::Prune { keep } => {
      println!("removed {}", store.cleanup_old_items(keep));
      Ok(())
    }
  }
}
