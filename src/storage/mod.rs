//! Durable key-value storage and the synchronous shim in front of it.
//!
//! This module provides:
//! - `DurableStore`: the asynchronous device storage interface
//! - `SqliteStore`: the on-disk implementation
//! - `LocalStorage`: a synchronous get/set/remove/clear view backed by an
//!   in-memory table, mirrored to the durable store in the background

mod shim;
mod sqlite;

use color_eyre::Result;
use std::future::Future;

pub use shim::{LocalStorage, StorageState};
pub use sqlite::SqliteStore;

/// Asynchronous durable key-value store.
pub trait DurableStore: Send + Sync + 'static {
  fn get_item(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

  fn set_item(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

  fn remove_item(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

  fn get_all_keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

  /// Values for `keys`, in order. Missing keys map to `None`.
  fn multi_get(
    &self,
    keys: &[String],
  ) -> impl Future<Output = Result<Vec<(String, Option<String>)>>> + Send;

  fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
pub mod testing {
  //! In-memory durable store with call counters, delays and failure switches.

  use super::DurableStore;
  use color_eyre::{eyre::eyre, Result};
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  #[derive(Default)]
  pub struct MemoryStore {
    pub data: Mutex<BTreeMap<String, String>>,
    pub delay: Duration,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub get_all_keys_calls: AtomicU32,
    pub multi_get_calls: AtomicU32,
    pub write_calls: AtomicU32,
  }

  impl MemoryStore {
    pub fn with_delay(delay: Duration) -> Self {
      Self {
        delay,
        ..Self::default()
      }
    }

    pub fn seeded(pairs: &[(&str, &str)]) -> Self {
      let store = Self::default();
      {
        let mut data = store.data.lock().unwrap();
        for (k, v) in pairs {
          data.insert(k.to_string(), v.to_string());
        }
      }
      store
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
      self.data.lock().unwrap().clone()
    }

    async fn pause(&self) {
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
    }

    async fn write<F: FnOnce(&mut BTreeMap<String, String>)>(&self, f: F) -> Result<()> {
      self.pause().await;
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_writes.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      f(&mut self.data.lock().unwrap());
      Ok(())
    }
  }

  impl DurableStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
      self.pause().await;
      Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
      let (key, value) = (key.to_string(), value.to_string());
      self.write(move |data| {
        data.insert(key, value);
      })
      .await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
      let key = key.to_string();
      self.write(move |data| {
        data.remove(&key);
      })
      .await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
      self.get_all_keys_calls.fetch_add(1, Ordering::SeqCst);
      self.pause().await;
      if self.fail_reads.load(Ordering::SeqCst) {
        return Err(eyre!("storage unavailable"));
      }
      Ok(self.data.lock().unwrap().keys().cloned().collect())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
      self.multi_get_calls.fetch_add(1, Ordering::SeqCst);
      self.pause().await;
      let data = self.data.lock().unwrap();
      Ok(
        keys
          .iter()
          .map(|k| (k.clone(), data.get(k).cloned()))
          .collect(),
      )
    }

    async fn clear(&self) -> Result<()> {
      self.write(|data| data.clear()).await
    }
  }
}
