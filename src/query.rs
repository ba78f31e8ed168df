//! Cached API reads with loading and error state.
//!
//! `ApiQuery<V>` reads one URL through a shared [`RequestCache`], so any
//! number of queries for the same URL share one request and one cached
//! value. Results arrive asynchronously and are picked up with `poll()`.
//!
//! # Example
//!
//! ```ignore
//! let mut query: ApiQuery<Profile> = ApiQuery::new(
//!     cache.clone(),
//!     fetcher.clone(),
//!     Some("https://api.example.com/profile".into()),
//!     QueryOptions::default(),
//! );
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match (query.data(), query.error()) {
//!     (Some(profile), _) => render_profile(profile),
//!     (None, Some(e)) => render_error(e),
//!     (None, None) => render_spinner(),
//! }
//! ```

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::{cache_key, DedupeOptions, Fetcher, RequestCache};
use crate::error::FetchError;

/// How a query uses the cache.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// Lifetime of fetched data; the cache default when `None`
  pub ttl: Option<Duration>,
  pub stale_while_revalidate: bool,
  /// Age after which cached data is refreshed
  pub stale_time: Duration,
  /// A disabled query never fetches
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      ttl: None,
      stale_while_revalidate: true,
      stale_time: Duration::from_secs(60), // Default 1 minute
      enabled: true,
    }
  }
}

/// The cache key a query uses for `url`.
pub fn query_key(url: &str) -> String {
  cache_key(&["api", url])
}

/// A cached read of one URL.
///
/// Errors are only reported while there is no cached data to show; a failed
/// refresh of data already on screen is logged and otherwise ignored.
pub struct ApiQuery<V = Value> {
  cache: RequestCache<Value>,
  fetcher: Arc<dyn Fetcher>,
  url: Option<String>,
  options: QueryOptions,
  data: Option<V>,
  loading: bool,
  error: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<Result<Value, FetchError>>>,
  /// Whether the running fetch started with cached data on hand
  had_cache: bool,
}

impl<V: DeserializeOwned> ApiQuery<V> {
  /// Create a query, seeded from whatever the cache already holds.
  pub fn new(
    cache: RequestCache<Value>,
    fetcher: Arc<dyn Fetcher>,
    url: Option<String>,
    options: QueryOptions,
  ) -> Self {
    let mut query = Self {
      cache,
      fetcher,
      url: None,
      options,
      data: None,
      loading: true,
      error: None,
      receiver: None,
      had_cache: false,
    };
    query.reset(url);
    query
  }

  fn reset(&mut self, url: Option<String>) {
    let cached = url.as_deref().and_then(|url| self.cache.get(&query_key(url)));
    self.loading = cached.is_none();
    self.data = cached.and_then(|value| decode(value).ok());
    self.error = None;
    self.receiver = None;
    self.url = url;
  }

  pub fn url(&self) -> Option<&str> {
    self.url.as_deref()
  }

  pub fn data(&self) -> Option<&V> {
    self.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.loading
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Point the query at another URL and fetch it.
  pub fn set_url(&mut self, url: Option<String>) {
    if url == self.url {
      return;
    }
    self.reset(url);
    self.fetch();
  }

  /// Load the data, using the cache when it is fresh.
  ///
  /// Stale cached data is shown straight away while it is refreshed. This
  /// is a no-op while a fetch is already running.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start(false);
  }

  /// Fetch again regardless of what is cached, joining any request for the
  /// same URL already in flight.
  pub fn refetch(&mut self) {
    // Drop any pending result in favour of the new one
    self.receiver = None;
    self.start(true);
  }

  /// Pick up the result of a running fetch.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let result = match receiver.try_recv() {
      Ok(result) => result,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        Err(FetchError::Aborted("Query was cancelled".to_string()))
      }
    };

    self.receiver = None;
    self.loading = false;
    match result.and_then(decode) {
      Ok(data) => {
        self.data = Some(data);
        self.error = None;
      }
      Err(e) => {
        warn!("Query for {} failed: {}", self.url.as_deref().unwrap_or(""), e);
        if !self.had_cache {
          self.error = Some(e.to_string());
        }
      }
    }
    true
  }

  fn start(&mut self, force: bool) {
    let url = match &self.url {
      Some(url) if self.options.enabled => url.clone(),
      _ => {
        self.loading = false;
        return;
      }
    };
    let key = query_key(&url);

    let cached = self.cache.get(&key);
    self.had_cache = cached.is_some();
    if let (Some(value), false) = (cached, force) {
      if let Ok(data) = decode(value) {
        self.data = Some(data);
      }
      if !self.cache.is_stale(&key, self.options.stale_time) {
        self.loading = false;
        return;
      }
    }

    if !self.had_cache {
      self.loading = true;
    }
    self.error = None;

    let fetcher = Arc::clone(&self.fetcher);
    let fetch = move || async move { fetcher.fetch_json(&url).await };
    if force {
      let pending = self.cache.fetch_coalesced(&key, fetch, self.options.ttl);
      self.spawn(pending);
    } else {
      let options = DedupeOptions {
        ttl: self.options.ttl,
        stale_while_revalidate: self.options.stale_while_revalidate,
        stale_time: self.options.stale_time,
      };
      let pending = self.cache.dedupe(&key, fetch, options);
      self.spawn(pending);
    }
  }

  fn spawn<F>(&mut self, pending: F)
  where
    F: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);

    tokio::spawn(pending.map(move |result| {
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(result);
    }));
  }
}

fn decode<V: DeserializeOwned>(value: Value) -> Result<V, FetchError> {
  serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string()))
}

impl<V: std::fmt::Debug> std::fmt::Debug for ApiQuery<V> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ApiQuery")
      .field("url", &self.url)
      .field("data", &self.data)
      .field("loading", &self.loading)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}
