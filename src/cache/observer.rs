use super::error::CacheError;
use super::key::QueryKey;
use super::layer::{Fetcher, QueryCache};
use super::traits::{CacheResult, CacheValue};

/// Handle expressing interest in one query key.
///
/// Keeps the entry alive while held; dropping the last observer of a key
/// starts its garbage-collection window.
pub struct QueryObserver<V: CacheValue> {
  cache: QueryCache<V>,
  key: QueryKey,
  fetcher: Fetcher<V>,
}

impl<V: CacheValue> QueryObserver<V> {
  pub(super) fn new(cache: QueryCache<V>, key: QueryKey, fetcher: Fetcher<V>) -> Self {
    Self {
      cache,
      key,
      fetcher,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Current cached value, fresh or stale.
  pub fn current(&self) -> Option<CacheResult<V>> {
    self.cache.read(&self.key)
  }

  /// Fresh value, fetched with this observer's fetch function if needed.
  pub async fn ensure_fresh(&self) -> Result<CacheResult<V>, CacheError> {
    self
      .cache
      .ensure_fresh_with(&self.key, self.fetcher.clone())
      .await
  }

  /// Invalidate and fetch again.
  pub async fn refetch(&self) -> Result<CacheResult<V>, CacheError> {
    self.cache.invalidate(&self.key);
    self.ensure_fresh().await
  }
}

impl<V: CacheValue> Drop for QueryObserver<V> {
  fn drop(&mut self) {
    self.cache.release(&self.key);
  }
}
