//! In-memory request cache with in-flight deduplication.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheEvent, CacheStats, DedupeOptions};
use crate::clock::{duration_ms, SharedClock};
use crate::error::FetchError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

/// An in-flight fetch that later callers for the same key join.
struct PendingRequest<V: Clone> {
  future: SharedFetch<V>,
  /// When the fetch started (ms since epoch)
  timestamp: i64,
  /// Distinguishes this fetch from a later one registered under the same key
  id: u64,
}

struct State<V: Clone> {
  entries: HashMap<String, CacheEntry<V>>,
  pending: HashMap<String, PendingRequest<V>>,
  next_id: u64,
}

/// Cache of fetched values keyed by string, with request coalescing and
/// stale-while-revalidate.
///
/// Cloning is cheap and clones share the same maps.
///
/// Fetches are spawned onto the current Tokio runtime, so `dedupe` and
/// `fetch_coalesced` must be called from within one. A spawned fetch always
/// settles and deregisters itself, even if every caller waiting on it has
/// gone away.
pub struct RequestCache<V: Clone = Value> {
  state: Arc<Mutex<State<V>>>,
  clock: SharedClock,
  default_ttl: Duration,
  /// How long an in-flight request may be joined by later callers
  dedup_window: Duration,
  events: broadcast::Sender<CacheEvent>,
}

impl<V> RequestCache<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(clock: SharedClock) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      state: Arc::new(Mutex::new(State {
        entries: HashMap::new(),
        pending: HashMap::new(),
        next_id: 0,
      })),
      clock,
      default_ttl: Duration::from_secs(5 * 60),
      dedup_window: Duration::from_secs(30),
      events,
    }
  }

  /// Set the lifetime used when `set` is given no ttl.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Set how long an in-flight request may be joined.
  pub fn with_dedup_window(mut self, window: Duration) -> Self {
    self.dedup_window = window;
    self
  }

  /// Subscribe to background revalidation outcomes.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  fn lock(&self) -> MutexGuard<'_, State<V>> {
    // The maps stay consistent across a panic, every mutation is a single call
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Cached value for `key`, or `None` if absent or expired.
  ///
  /// Expired entries are removed on the way out.
  pub fn get(&self, key: &str) -> Option<V> {
    let now = self.clock.now_ms();
    let mut state = self.lock();
    match state.entries.get(key) {
      Some(entry) if entry.is_live(now) => Some(entry.data.clone()),
      Some(_) => {
        state.entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Store `data` for `ttl`, or the default ttl. Expired entries are swept
  /// out on the way.
  pub fn set(&self, key: &str, data: V, ttl: Option<Duration>) {
    let now = self.clock.now_ms();
    let ttl = ttl.unwrap_or(self.default_ttl);
    let entry = CacheEntry {
      data,
      timestamp: now,
      expires_at: now.saturating_add(duration_ms(ttl)),
    };
    let mut state = self.lock();
    state.entries.retain(|_, e| e.is_live(now));
    state.entries.insert(key.to_string(), entry);
  }

  pub fn has(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Whether the value for `key` is older than `max_age`. Absent is stale.
  pub fn is_stale(&self, key: &str, max_age: Duration) -> bool {
    let now = self.clock.now_ms();
    self
      .lock()
      .entries
      .get(key)
      .map_or(true, |entry| entry.age_ms(now) > duration_ms(max_age))
  }

  /// Drop the cached value and any in-flight request for `key`.
  pub fn invalidate(&self, key: &str) {
    let mut state = self.lock();
    state.entries.remove(key);
    state.pending.remove(key);
  }

  /// Drop every cached value and in-flight request whose key matches.
  pub fn invalidate_pattern(&self, pattern: &Regex) {
    let mut state = self.lock();
    state.entries.retain(|key, _| !pattern.is_match(key));
    state.pending.retain(|key, _| !pattern.is_match(key));
  }

  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.pending.clear();
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.lock();
    CacheStats {
      cache_size: state.entries.len(),
      pending_requests: state.pending.len(),
    }
  }

  /// Fetch `key` at most once across concurrent callers.
  ///
  /// 1. A cached value is returned as is. With stale-while-revalidate, a
  ///    value older than `stale_time` also starts a background refresh.
  /// 2. Otherwise an in-flight request younger than the dedup window is
  ///    joined.
  /// 3. Otherwise `fetcher` is called and its result cached on success.
  ///
  /// The lookup and any registration happen before this returns, so the
  /// returned future can be awaited later without opening a race.
  pub fn dedupe<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: DedupeOptions,
  ) -> BoxFuture<'static, Result<V, FetchError>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    if let Some(cached) = self.get(key) {
      if options.stale_while_revalidate && self.is_stale(key, options.stale_time) {
        self.revalidate_in_background(key, fetcher, options.ttl);
      }
      debug!("Cache hit for {}", key);
      return future::ready(Ok(cached)).boxed();
    }

    self.fetch_coalesced(key, fetcher, options.ttl).boxed()
  }

  /// Fetch `key` ignoring any cached value, still joining an in-flight
  /// request for it.
  pub fn fetch_coalesced<F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> SharedFetch<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let now = self.clock.now_ms();
    let window = duration_ms(self.dedup_window);

    let (id, tx, shared) = {
      let mut state = self.lock();
      if let Some(pending) = state.pending.get(key) {
        if now.saturating_sub(pending.timestamp) < window {
          debug!("Joining in-flight request for {}", key);
          return pending.future.clone();
        }
      }
      // Register before the lock is released so no second fetch can start
      Self::register(&mut state, key, now)
    };

    debug!("Fetching {}", key);
    self.launch(key, id, tx, fetcher(), ttl, false);
    shared
  }

  fn revalidate_in_background<F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let now = self.clock.now_ms();
    let (id, tx, _) = {
      let mut state = self.lock();
      if state.pending.contains_key(key) {
        return;
      }
      Self::register(&mut state, key, now)
    };

    debug!("Revalidating {} in background", key);
    self.launch(key, id, tx, fetcher(), ttl, true);
  }

  /// Register a pending request for `key` and return the sender that
  /// settles it.
  fn register(
    state: &mut State<V>,
    key: &str,
    now: i64,
  ) -> (u64, oneshot::Sender<Result<V, FetchError>>, SharedFetch<V>) {
    let id = state.next_id;
    state.next_id += 1;

    let (tx, rx) = oneshot::channel();
    let future = rx
      .map(|received| {
        received.unwrap_or_else(|_| Err(FetchError::Aborted("fetch task dropped".to_string())))
      })
      .boxed()
      .shared();

    state.pending.insert(
      key.to_string(),
      PendingRequest {
        future: future.clone(),
        timestamp: now,
        id,
      },
    );
    (id, tx, future)
  }

  fn launch<Fut>(
    &self,
    key: &str,
    id: u64,
    tx: oneshot::Sender<Result<V, FetchError>>,
    fetch: Fut,
    ttl: Option<Duration>,
    background: bool,
  ) where
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let cache = self.clone();
    let key = key.to_string();

    tokio::spawn(async move {
      let result = fetch.await;
      cache.settle(&key, id, &result, ttl);

      if background {
        let event = match &result {
          Ok(_) => CacheEvent::Revalidated { key: key.clone() },
          Err(e) => {
            warn!("Background revalidation failed for {}: {}", key, e);
            CacheEvent::RevalidationFailed {
              key: key.clone(),
              error: e.to_string(),
            }
          }
        };
        // No subscribers is fine
        let _ = cache.events.send(event);
      }

      // Receivers may all have gone away
      let _ = tx.send(result);
    });
  }

  /// Cache a successful result and deregister the request, unless a newer
  /// request has replaced it.
  fn settle(&self, key: &str, id: u64, result: &Result<V, FetchError>, ttl: Option<Duration>) {
    if let Ok(data) = result {
      self.set(key, data.clone(), ttl);
    }

    let mut state = self.lock();
    if state.pending.get(key).is_some_and(|p| p.id == id) {
      state.pending.remove(key);
    }
  }
}

impl<V: Clone> Clone for RequestCache<V> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      clock: Arc::clone(&self.clock),
      default_ttl: self.default_ttl,
      dedup_window: self.dedup_window,
      events: self.events.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicUsize, Ordering};

  const NOW: i64 = 1_700_000_000_000;

  fn cache() -> (Arc<ManualClock>, RequestCache<u32>) {
    let clock = Arc::new(ManualClock::new(NOW));
    (clock.clone(), RequestCache::new(clock))
  }

  /// A fetcher factory that counts how many fetches it started.
  fn counting(
    counter: &Arc<AtomicUsize>,
    value: u32,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, FetchError>> {
    let counter = counter.clone();
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(delay).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_callers_share_one_fetch() {
    let (_, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));

    let calls: Vec<_> = (0..10)
      .map(|_| {
        cache.dedupe(
          "profile",
          counting(&counter, 7, Duration::from_millis(20)),
          DedupeOptions::default(),
        )
      })
      .collect();
    assert_eq!(cache.stats().pending_requests, 1);

    let results = future::join_all(calls).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(results.into_iter().all(|r| r == Ok(7)));
    assert_eq!(cache.get("profile"), Some(7));
    assert_eq!(cache.stats().pending_requests, 0);
  }

  #[tokio::test]
  async fn test_cached_value_skips_fetch() {
    let (_, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));
    cache.set("k", 1, None);

    let value = cache
      .dedupe("k", counting(&counter, 2, Duration::ZERO), DedupeOptions::default())
      .await;
    assert_eq!(value, Ok(1));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_zero_ttl_always_refetches() {
    let (_, cache) = cache();
    cache.set("k", 1, Some(Duration::ZERO));
    assert_eq!(cache.get("k"), None);

    let counter = Arc::new(AtomicUsize::new(0));
    let options = DedupeOptions {
      ttl: Some(Duration::ZERO),
      ..DedupeOptions::default()
    };
    for _ in 0..2 {
      let value = cache
        .dedupe("k", counting(&counter, 5, Duration::ZERO), options)
        .await;
      assert_eq!(value, Ok(5));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_expired_entry_is_absent() {
    let (clock, cache) = cache();
    cache.set("k", 1, Some(Duration::from_secs(10)));
    assert!(cache.has("k"));

    clock.advance(Duration::from_millis(9_999));
    assert_eq!(cache.get("k"), Some(1));

    clock.advance(Duration::from_millis(2));
    assert_eq!(cache.get("k"), None);
    assert!(!cache.has("k"));
    assert_eq!(cache.stats().cache_size, 0);
  }

  #[test]
  fn test_set_sweeps_expired_entries() {
    let (clock, cache) = cache();
    cache.set("short", 1, Some(Duration::from_secs(1)));
    cache.set("long", 2, Some(Duration::from_secs(60)));
    clock.advance(Duration::from_secs(2));

    cache.set("fresh", 3, None);
    assert_eq!(cache.stats().cache_size, 2);
    assert_eq!(cache.get("long"), Some(2));
  }

  #[test]
  fn test_default_ttl() {
    let (clock, cache) = cache();
    let cache = cache.with_default_ttl(Duration::from_secs(1));
    cache.set("k", 1, None);
    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.get("k"), None);
  }

  #[test]
  fn test_is_stale() {
    let (clock, cache) = cache();
    assert!(cache.is_stale("missing", Duration::from_secs(60)));

    cache.set("k", 1, None);
    clock.advance(Duration::from_secs(60));
    assert!(!cache.is_stale("k", Duration::from_secs(60)));
    clock.advance(Duration::from_millis(1));
    assert!(cache.is_stale("k", Duration::from_secs(60)));
  }

  #[test]
  fn test_invalidate_pattern() {
    let (_, cache) = cache();
    cache.set("api:/users/1", 1, None);
    cache.set("api:/users/2", 2, None);
    cache.set("api:/teams/1", 3, None);

    cache.invalidate_pattern(&Regex::new("^api:/users/").unwrap());
    assert_eq!(cache.stats().cache_size, 1);
    assert!(cache.has("api:/teams/1"));

    cache.invalidate("api:/teams/1");
    assert_eq!(cache.stats().cache_size, 0);

    cache.set("x", 1, None);
    cache.clear();
    assert!(!cache.has("x"));
  }

  #[tokio::test]
  async fn test_failure_reaches_every_waiter() {
    let (_, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));

    let failing = |counter: &Arc<AtomicUsize>| {
      let counter = counter.clone();
      move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(10)).await;
          Err::<u32, _>(FetchError::Status {
            status: 500,
            reason: "Internal Server Error".into(),
          })
        }
      }
    };

    let a = cache.dedupe("k", failing(&counter), DedupeOptions::default());
    let b = cache.dedupe("k", failing(&counter), DedupeOptions::default());
    let (a, b) = futures::join!(a, b);

    assert!(matches!(a, Err(FetchError::Status { status: 500, .. })));
    assert_eq!(a, b);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().pending_requests, 0);
    assert_eq!(cache.get("k"), None);

    // the failed request no longer blocks a fresh attempt
    let value = cache
      .dedupe("k", counting(&counter, 3, Duration::ZERO), DedupeOptions::default())
      .await;
    assert_eq!(value, Ok(3));
  }

  #[tokio::test]
  async fn test_old_pending_request_is_not_joined() {
    let (clock, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));

    let first = cache.dedupe(
      "k",
      counting(&counter, 1, Duration::from_millis(30)),
      DedupeOptions::default(),
    );
    clock.advance(Duration::from_secs(31));
    let second = cache.dedupe(
      "k",
      counting(&counter, 2, Duration::from_millis(10)),
      DedupeOptions::default(),
    );
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    assert_eq!(second.await, Ok(2));
    assert_eq!(first.await, Ok(1));
    assert_eq!(cache.stats().pending_requests, 0);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_then_refreshes() {
    let (clock, cache) = cache();
    let mut events = cache.subscribe();
    let counter = Arc::new(AtomicUsize::new(0));
    let options = DedupeOptions {
      stale_while_revalidate: true,
      stale_time: Duration::from_secs(60),
      ..DedupeOptions::default()
    };

    cache.set("k", 1, None);

    // fresh: served, no refresh
    let value = cache
      .dedupe("k", counting(&counter, 2, Duration::ZERO), options)
      .await;
    assert_eq!(value, Ok(1));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // stale: still served immediately, refreshed behind the caller's back
    clock.advance(Duration::from_secs(61));
    let value = cache
      .dedupe("k", counting(&counter, 2, Duration::from_millis(10)), options)
      .await;
    assert_eq!(value, Ok(1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // a second stale read while the refresh is in flight does not start another
    let value = cache
      .dedupe("k", counting(&counter, 3, Duration::ZERO), options)
      .await;
    assert_eq!(value, Ok(1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert_eq!(
      events.recv().await.unwrap(),
      CacheEvent::Revalidated { key: "k".into() }
    );
    assert_eq!(cache.get("k"), Some(2));
  }

  #[tokio::test]
  async fn test_background_failure_goes_to_event_stream() {
    let (clock, cache) = cache();
    let mut events = cache.subscribe();
    let options = DedupeOptions {
      stale_while_revalidate: true,
      ..DedupeOptions::default()
    };

    cache.set("k", 1, None);
    clock.advance(Duration::from_secs(120));

    let value = cache
      .dedupe(
        "k",
        || async { Err::<u32, _>(FetchError::Transport("connection reset".into())) },
        options,
      )
      .await;
    assert_eq!(value, Ok(1));

    match events.recv().await.unwrap() {
      CacheEvent::RevalidationFailed { key, error } => {
        assert_eq!(key, "k");
        assert!(error.contains("connection reset"));
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(cache.get("k"), Some(1));
    assert_eq!(cache.stats().pending_requests, 0);
  }

  #[tokio::test]
  async fn test_fetch_coalesced_bypasses_cache_but_joins_in_flight() {
    let (_, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));
    cache.set("k", 1, None);

    let a = cache.fetch_coalesced("k", counting(&counter, 9, Duration::from_millis(10)), None);
    let b = cache.fetch_coalesced("k", counting(&counter, 10, Duration::from_millis(10)), None);
    let (a, b) = futures::join!(a, b);

    assert_eq!((a, b), (Ok(9), Ok(9)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("k"), Some(9));
  }

  #[tokio::test]
  async fn test_dropped_waiters_still_settle() {
    let (_, cache) = cache();
    let counter = Arc::new(AtomicUsize::new(0));

    drop(cache.dedupe(
      "k",
      counting(&counter, 4, Duration::from_millis(5)),
      DedupeOptions::default(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cache.get("k"), Some(4));
    assert_eq!(cache.stats().pending_requests, 0);
  }
}
