//! Dehydrate the query cache into local storage and hydrate it back.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::QueryKey;
use super::layer::QueryCache;
use super::traits::CacheValue;
use crate::config::CacheConfig;
use crate::storage::{DurableStore, LocalStorage};

/// Storage key holding the dehydrated cache.
pub const CACHE_STORAGE_KEY: &str = "fieldsync.query-cache";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache<V> {
  buster: String,
  saved_at: DateTime<Utc>,
  entries: Vec<PersistedEntry<V>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<V> {
  key: QueryKey,
  value: V,
  fetched_at: DateTime<Utc>,
  #[serde(default)]
  stale: bool,
}

/// Saves and restores cache entries through a [`LocalStorage`].
pub struct CachePersister<S> {
  storage: LocalStorage<S>,
  buster: String,
  max_age: Duration,
}

impl<S: DurableStore> CachePersister<S> {
  pub fn new(storage: LocalStorage<S>, config: &CacheConfig) -> Self {
    Self {
      storage,
      buster: config.buster.clone(),
      max_age: config.persist_max_age(),
    }
  }

  fn is_expired(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let age = (now - fetched_at).to_std().unwrap_or(Duration::ZERO);
    age > self.max_age
  }

  /// Write every entry younger than `max_age` to storage. Returns how many.
  pub fn persist<V>(&self, cache: &QueryCache<V>) -> Result<usize>
  where
    V: CacheValue + Serialize,
  {
    let now = Utc::now();
    let entries: Vec<PersistedEntry<V>> = cache
      .snapshot()
      .into_iter()
      .filter(|(_, _, fetched_at, _)| !self.is_expired(*fetched_at, now))
      .map(|(key, value, fetched_at, stale)| PersistedEntry {
        key,
        value,
        fetched_at,
        stale,
      })
      .collect();

    let count = entries.len();
    let persisted = PersistedCache {
      buster: self.buster.clone(),
      saved_at: now,
      entries,
    };
    let encoded =
      serde_json::to_string(&persisted).map_err(|e| eyre!("Failed to serialize cache: {}", e))?;

    self.storage.set_item(CACHE_STORAGE_KEY, &encoded);
    debug!(count, "Persisted query cache");
    Ok(count)
  }

  /// Load persisted entries into `cache`. Returns how many were restored.
  ///
  /// Unreadable data or a different buster discards the persisted cache.
  pub fn restore<V>(&self, cache: &QueryCache<V>) -> usize
  where
    V: CacheValue + DeserializeOwned,
  {
    let Some(raw) = self.storage.get_item(CACHE_STORAGE_KEY) else {
      return 0;
    };

    let persisted: PersistedCache<V> = match serde_json::from_str(&raw) {
      Ok(persisted) => persisted,
      Err(e) => {
        warn!("Discarding unreadable persisted cache: {}", e);
        self.discard();
        return 0;
      }
    };

    if persisted.buster != self.buster {
      info!(
        "Discarding persisted cache from buster '{}' (current '{}')",
        persisted.buster, self.buster
      );
      self.discard();
      return 0;
    }

    let now = Utc::now();
    let mut restored = 0;
    for entry in persisted.entries {
      if self.is_expired(entry.fetched_at, now) {
        continue;
      }
      if cache.restore(entry.key, entry.value, entry.fetched_at, entry.stale) {
        restored += 1;
      }
    }

    debug!(restored, saved_at = %persisted.saved_at, "Hydrated query cache");
    restored
  }

  pub fn discard(&self) {
    self.storage.remove_item(CACHE_STORAGE_KEY);
  }
}
