//! Query cache that orchestrates freshness, deduplication and retries.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::error::{CacheError, FetchError};
use super::key::QueryKey;
use super::observer::QueryObserver;
use super::retry::RetryPolicy;
use super::traits::{CacheEvent, CacheResult, CacheValue};
use crate::config::{CacheConfig, RetryConfig};
use crate::lifecycle::{Connectivity, LifecycleEvent};

/// A factory for fetch futures, kept so observed keys can be refreshed later.
pub type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<CacheResult<V>, CacheError>>>;

/// Turn a closure returning a future into a storable [`Fetcher`].
pub fn fetcher<V, F, Fut>(fetch_fn: F) -> Fetcher<V>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
  Arc::new(move || fetch_fn().boxed())
}

struct InFlight<V> {
  id: u64,
  fetch: SharedFetch<V>,
}

/// Fetches for one key that have been issued but not yet completed,
/// including ones detached by an invalidation.
#[derive(Default)]
struct Outstanding {
  count: usize,
  /// Bumped by every invalidation while fetches are outstanding
  epoch: u64,
}

struct ObserverSlot<V> {
  count: usize,
  fetcher: Fetcher<V>,
}

struct CacheState<V> {
  entries: HashMap<QueryKey, CacheEntry<V>>,
  in_flight: HashMap<QueryKey, InFlight<V>>,
  /// Present only while at least one fetch for the key is running
  outstanding: HashMap<QueryKey, Outstanding>,
  observers: HashMap<QueryKey, ObserverSlot<V>>,
  next_fetch_id: u64,
}

struct Inner<V> {
  state: Mutex<CacheState<V>>,
  stale_time: Duration,
  gc_time: Duration,
  refetch_on_reconnect: bool,
  refetch_on_focus: bool,
  query_retry: RetryPolicy,
  mutation_retry: RetryPolicy,
  connectivity: Connectivity,
  events: broadcast::Sender<CacheEvent>,
}

impl<V> Inner<V> {
  fn state(&self) -> MutexGuard<'_, CacheState<V>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self, event: CacheEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

impl<V: CacheValue> Inner<V> {
  /// Store the outcome of a query fetch.
  ///
  /// Writes are applied in resolution order. A fetch issued before the key's
  /// latest invalidation still writes, but its entry starts out stale.
  fn complete_fetch(
    &self,
    key: &QueryKey,
    id: u64,
    epoch: u64,
    result: Result<V, CacheError>,
  ) -> Result<CacheResult<V>, CacheError> {
    let mut state = self.state();
    if state.in_flight.get(key).map(|f| f.id) == Some(id) {
      state.in_flight.remove(key);
    }

    let superseded = match state.outstanding.get_mut(key) {
      Some(outstanding) => {
        let superseded = epoch < outstanding.epoch;
        outstanding.count = outstanding.count.saturating_sub(1);
        if outstanding.count == 0 {
          state.outstanding.remove(key);
        }
        superseded
      }
      None => false,
    };

    let value = match result {
      Ok(value) => value,
      Err(err) => {
        debug!(key = %key, "Fetch failed, keeping previous entry: {}", err);
        return Err(err);
      }
    };

    let fetched_wall = Utc::now();
    let mut entry = CacheEntry::new(
      value.clone(),
      Instant::now(),
      fetched_wall,
      self.stale_time,
      self.gc_time,
    );
    if superseded {
      debug!(key = %key, "Fetch was superseded by an invalidation, storing as stale");
      entry.invalidate();
    }
    state.entries.insert(key.clone(), entry);
    drop(state);

    self.notify(CacheEvent::Updated(key.clone()));
    Ok(CacheResult::from_network(value, fetched_wall))
  }
}

/// Client-side cache of server responses keyed by [`QueryKey`].
///
/// Serves fresh entries without touching the network, shares one in-flight
/// fetch per key, retries transient failures, and evicts entries nobody has
/// observed for `gc_time`.
pub struct QueryCache<V> {
  inner: Arc<Inner<V>>,
}

impl<V: CacheValue> QueryCache<V> {
  pub fn new(cache: &CacheConfig, retry: &RetryConfig, connectivity: Connectivity) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState {
          entries: HashMap::new(),
          in_flight: HashMap::new(),
          outstanding: HashMap::new(),
          observers: HashMap::new(),
          next_fetch_id: 0,
        }),
        stale_time: cache.stale_time(),
        gc_time: cache.gc_time(),
        refetch_on_reconnect: cache.refetch_on_reconnect,
        refetch_on_focus: cache.refetch_on_focus,
        query_retry: RetryPolicy::queries(retry),
        mutation_retry: RetryPolicy::mutations(retry),
        connectivity,
        events,
      }),
    }
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }

  /// Receive a notification whenever an entry changes.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  /// Return the cached entry for `key`, fresh or stale. Never fetches.
  pub fn read(&self, key: &QueryKey) -> Option<CacheResult<V>> {
    let state = self.inner.state();
    let now = Instant::now();
    state.entries.get(key).map(|entry| {
      CacheResult::from_cache(entry.value.clone(), entry.fetched_wall, entry.is_stale(now))
    })
  }

  pub fn len(&self) -> usize {
    self.inner.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Cached keys, in no particular order.
  pub fn keys(&self) -> Vec<QueryKey> {
    self.inner.state().entries.keys().cloned().collect()
  }

  /// Whether a fetch for `key` is currently running.
  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self.inner.state().in_flight.contains_key(key)
  }

  /// Wait for the fetches currently in flight, including background
  /// refreshes, to finish. Their outcomes are already in the cache.
  pub async fn settle(&self) {
    let pending: Vec<SharedFetch<V>> = self
      .inner
      .state()
      .in_flight
      .values()
      .map(|in_flight| in_flight.fetch.clone())
      .collect();
    futures::future::join_all(pending).await;
  }

  /// Return a fresh value for `key`, fetching when absent or stale.
  ///
  /// Concurrent callers for the same key share a single fetch. On failure the
  /// previous entry (if any) stays readable through [`QueryCache::read`].
  pub async fn ensure_fresh<F, Fut>(&self, key: &QueryKey, fetch_fn: F) -> Result<CacheResult<V>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    self.ensure_fresh_with(key, fetcher(fetch_fn)).await
  }

  pub(super) async fn ensure_fresh_with(
    &self,
    key: &QueryKey,
    fetcher: Fetcher<V>,
  ) -> Result<CacheResult<V>, CacheError> {
    let fetch = {
      let mut state = self.inner.state();
      if let Some(entry) = state.entries.get(key) {
        if !entry.is_stale(Instant::now()) {
          debug!(key = %key, "Cache hit");
          return Ok(CacheResult::from_cache(
            entry.value.clone(),
            entry.fetched_wall,
            false,
          ));
        }
      }
      self.start_fetch(&mut state, key, fetcher)
    };

    fetch.await
  }

  /// Stale-while-revalidate read.
  ///
  /// A stale entry is returned immediately while a background refresh runs;
  /// only a missing entry makes the caller wait for the network.
  pub async fn get_or_revalidate<F, Fut>(
    &self,
    key: &QueryKey,
    fetch_fn: F,
  ) -> Result<CacheResult<V>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let fetch = {
      let mut state = self.inner.state();
      let now = Instant::now();
      let cached = state.entries.get(key).map(|entry| {
        CacheResult::from_cache(entry.value.clone(), entry.fetched_wall, entry.is_stale(now))
      });

      match cached {
        Some(result) if !result.is_stale() => return Ok(result),
        Some(result) => {
          debug!(key = %key, "Serving stale entry, refreshing in background");
          // The fetch task is detached; dropping the handle doesn't cancel it
          drop(self.start_fetch(&mut state, key, fetcher(fetch_fn)));
          return Ok(result);
        }
        None => self.start_fetch(&mut state, key, fetcher(fetch_fn)),
      }
    };

    fetch.await
  }

  /// Join the in-flight fetch for `key`, or spawn a new one.
  ///
  /// Must be called with the state lock held: the spawned task takes the same
  /// lock to complete, so it cannot finish before it is registered.
  fn start_fetch(
    &self,
    state: &mut CacheState<V>,
    key: &QueryKey,
    fetcher: Fetcher<V>,
  ) -> SharedFetch<V> {
    if let Some(in_flight) = state.in_flight.get(key) {
      debug!(key = %key, "Joining in-flight fetch");
      return in_flight.fetch.clone();
    }

    let id = state.next_fetch_id;
    state.next_fetch_id += 1;
    let outstanding = state.outstanding.entry(key.clone()).or_default();
    outstanding.count += 1;
    let epoch = outstanding.epoch;

    debug!(key = %key, id, "Fetching");
    let inner = Arc::clone(&self.inner);
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let result = inner
        .query_retry
        .run(&inner.connectivity, || fetcher())
        .await;
      inner.complete_fetch(&task_key, id, epoch, result)
    });

    let fetch = async move {
      handle
        .await
        .unwrap_or_else(|e| Err(CacheError::Aborted(e.to_string())))
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.clone(),
      InFlight {
        id,
        fetch: fetch.clone(),
      },
    );
    fetch
  }

  /// Force `key` stale so the next [`QueryCache::ensure_fresh`] refetches.
  ///
  /// A fetch already running is detached from deduplication but allowed to
  /// finish; its result is stored as stale. Returns whether anything was
  /// cached or in flight for the key.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let mut state = self.inner.state();
    let found = Self::invalidate_locked(&mut state, key);
    drop(state);

    if found {
      debug!(key = %key, "Invalidated");
      self.inner.notify(CacheEvent::Invalidated(key.clone()));
    }
    found
  }

  /// Invalidate every key starting with `prefix`. Returns how many matched.
  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
    let mut state = self.inner.state();
    let mut matching: Vec<QueryKey> = state
      .entries
      .keys()
      .chain(state.in_flight.keys())
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    matching.sort_by_key(QueryKey::cache_hash);
    matching.dedup();

    for key in &matching {
      Self::invalidate_locked(&mut state, key);
    }
    drop(state);

    for key in &matching {
      self.inner.notify(CacheEvent::Invalidated(key.clone()));
    }
    debug!(prefix = %prefix, count = matching.len(), "Invalidated by prefix");
    matching.len()
  }

  fn invalidate_locked(state: &mut CacheState<V>, key: &QueryKey) -> bool {
    let detached = state.in_flight.remove(key).is_some();
    let cached = match state.entries.get_mut(key) {
      Some(entry) => {
        entry.invalidate();
        true
      }
      None => false,
    };
    // Fetches issued before this point must not store a fresh entry
    if let Some(outstanding) = state.outstanding.get_mut(key) {
      outstanding.epoch += 1;
    }
    detached || cached
  }

  /// Run a write-type request under the mutation retry policy.
  pub async fn mutate<F, Fut, T>(&self, fetch_fn: F) -> Result<T, CacheError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    self
      .inner
      .mutation_retry
      .run(&self.inner.connectivity, fetch_fn)
      .await
  }

  /// Run a mutation and, when it succeeds, invalidate every key under the
  /// given prefixes.
  pub async fn mutate_and_invalidate<F, Fut, T>(
    &self,
    prefixes: &[QueryKey],
    fetch_fn: F,
  ) -> Result<T, CacheError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let value = self.mutate(fetch_fn).await?;
    for prefix in prefixes {
      self.invalidate_prefix(prefix);
    }
    Ok(value)
  }

  /// Register interest in `key`.
  ///
  /// While an observer is alive the entry is never collected, and lifecycle
  /// refetches use the given fetch function.
  pub fn observe<F, Fut>(&self, key: QueryKey, fetch_fn: F) -> QueryObserver<V>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let fetcher = fetcher(fetch_fn);
    let mut state = self.inner.state();
    state
      .observers
      .entry(key.clone())
      .and_modify(|slot| {
        slot.count += 1;
        slot.fetcher = Arc::clone(&fetcher);
      })
      .or_insert_with(|| ObserverSlot {
        count: 1,
        fetcher: Arc::clone(&fetcher),
      });
    drop(state);

    QueryObserver::new(self.clone(), key, fetcher)
  }

  pub fn observer_count(&self, key: &QueryKey) -> usize {
    self
      .inner
      .state()
      .observers
      .get(key)
      .map_or(0, |slot| slot.count)
  }

  /// Drop one observer of `key`; the last one starts the collection window.
  pub(super) fn release(&self, key: &QueryKey) {
    let mut state = self.inner.state();
    let remaining = match state.observers.get_mut(key) {
      Some(slot) => {
        slot.count = slot.count.saturating_sub(1);
        slot.count
      }
      None => return,
    };

    if remaining == 0 {
      state.observers.remove(key);
      let gc_time = self.inner.gc_time;
      if let Some(entry) = state.entries.get_mut(key) {
        entry.release(Instant::now(), gc_time);
      }
    }
  }

  /// Evict unobserved entries whose collection deadline has passed.
  pub fn collect_garbage(&self) -> Vec<QueryKey> {
    let mut state = self.inner.state();
    let now = Instant::now();

    let expired: Vec<QueryKey> = state
      .entries
      .iter()
      .filter(|(key, entry)| {
        entry.is_collectable(now)
          && !state.observers.contains_key(*key)
          && !state.in_flight.contains_key(*key)
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      state.entries.remove(key);
    }
    drop(state);

    for key in &expired {
      debug!(key = %key, "Evicted");
      self.inner.notify(CacheEvent::Evicted(key.clone()));
    }
    expired
  }

  /// Periodically run [`QueryCache::collect_garbage`].
  ///
  /// The task stops on its own once every handle to the cache is dropped.
  pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let evicted = QueryCache { inner }.collect_garbage();
        if !evicted.is_empty() {
          debug!(count = evicted.len(), "Garbage collected cache entries");
        }
      }
    })
  }

  /// Refresh every observed entry that is missing or stale, in the background.
  ///
  /// Returns the number of keys a fetch was started or joined for.
  pub fn refetch_stale_observed(&self) -> usize {
    if !self.inner.connectivity.is_online() {
      return 0;
    }

    let mut state = self.inner.state();
    let now = Instant::now();
    let due: Vec<(QueryKey, Fetcher<V>)> = state
      .observers
      .iter()
      .filter(|(key, _)| {
        state
          .entries
          .get(*key)
          .map_or(true, |entry| entry.is_stale(now))
      })
      .map(|(key, slot)| (key.clone(), Arc::clone(&slot.fetcher)))
      .collect();

    for (key, fetcher) in &due {
      drop(self.start_fetch(&mut state, key, Arc::clone(fetcher)));
    }
    due.len()
  }

  /// React to one lifecycle signal. Returns the number of refetches started.
  pub fn handle_lifecycle(&self, event: LifecycleEvent) -> usize {
    match event {
      LifecycleEvent::Online => {
        let reconnected = self.inner.connectivity.set_online(true);
        if reconnected {
          info!("Connectivity restored");
          if self.inner.refetch_on_reconnect {
            return self.refetch_stale_observed();
          }
        }
        0
      }
      LifecycleEvent::Offline => {
        if self.inner.connectivity.is_online() {
          warn!("Connectivity lost, fetches will fail fast");
        }
        self.inner.connectivity.set_online(false);
        0
      }
      LifecycleEvent::Foreground => {
        if self.inner.refetch_on_focus {
          self.refetch_stale_observed()
        } else {
          0
        }
      }
      LifecycleEvent::Background => {
        debug!("Application moved to background");
        0
      }
    }
  }

  /// Consume lifecycle events until the channel closes.
  pub fn listen(&self, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        let started = cache.handle_lifecycle(event);
        if started > 0 {
          debug!(?event, started, "Lifecycle refetch");
        }
      }
    })
  }

  /// Copy of every entry with its wall-clock fetch time and staleness.
  pub(super) fn snapshot(&self) -> Vec<(QueryKey, V, DateTime<Utc>, bool)> {
    let now = Instant::now();
    self
      .inner
      .state()
      .entries
      .iter()
      .map(|(key, entry)| {
        (
          key.clone(),
          entry.value.clone(),
          entry.fetched_wall,
          entry.is_stale(now),
        )
      })
      .collect()
  }

  /// Insert an entry fetched earlier (possibly by a previous process).
  ///
  /// Freshness is computed from the original fetch time; `stale` marks an
  /// entry that was invalidated before it was saved. Existing entries that
  /// are at least as recent win.
  pub(super) fn restore(
    &self,
    key: QueryKey,
    value: V,
    fetched_wall: DateTime<Utc>,
    stale: bool,
  ) -> bool {
    let mut state = self.inner.state();
    if let Some(existing) = state.entries.get(&key) {
      if existing.fetched_wall >= fetched_wall {
        return false;
      }
    }

    let now = Instant::now();
    let age = (Utc::now() - fetched_wall).to_std().unwrap_or(Duration::ZERO);
    let (fetched_at, representable) = match now.checked_sub(age) {
      Some(at) => (at, true),
      None => (now, false),
    };

    let mut entry = CacheEntry::new(
      value,
      fetched_at,
      fetched_wall,
      self.inner.stale_time,
      self.inner.gc_time,
    );
    if stale || !representable {
      entry.invalidate();
    }
    state.entries.insert(key, entry);
    true
  }
}

impl<V> Clone for QueryCache<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
