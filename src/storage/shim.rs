//! Synchronous key-value view over an asynchronous durable store.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{debug, info, warn};

use super::DurableStore;

/// Lifecycle of the in-memory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
  Uninitialized,
  Initializing,
  Initialized,
}

/// Durable write queued behind a synchronous call.
enum WriteOp {
  Set(String, String),
  Remove(String),
  Clear,
  /// Resolves once every earlier op has been applied
  Flush(oneshot::Sender<()>),
}

struct Table {
  items: BTreeMap<String, String>,
  state: StorageState,
  /// Keys written or removed before the bulk load finished
  touched: HashSet<String>,
  /// `clear()` ran before the bulk load finished
  cleared: bool,
}

struct Inner<S> {
  store: Arc<S>,
  table: Mutex<Table>,
  init: OnceCell<()>,
  writes: mpsc::UnboundedSender<WriteOp>,
}

impl<S> Inner<S> {
  fn table(&self) -> MutexGuard<'_, Table> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn enqueue(&self, op: WriteOp) {
    if self.writes.send(op).is_err() {
      warn!("Storage writer has stopped, durable write dropped");
    }
  }
}

/// Web-Storage-like API with synchronous reads and writes.
///
/// Every mutation lands in the in-memory table before returning and is then
/// written to the durable store by a background task, in call order. Durable
/// failures are logged and otherwise ignored: for the rest of the process the
/// in-memory table is the source of truth.
///
/// Reads only see durable data after [`LocalStorage::initialize`] completes.
/// Must be created inside a tokio runtime.
pub struct LocalStorage<S> {
  inner: Arc<Inner<S>>,
}

impl<S: DurableStore> LocalStorage<S> {
  pub fn new(store: S) -> Self {
    let store = Arc::new(store);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(Arc::clone(&store), rx));

    Self {
      inner: Arc::new(Inner {
        store,
        table: Mutex::new(Table {
          items: BTreeMap::new(),
          state: StorageState::Uninitialized,
          touched: HashSet::new(),
          cleared: false,
        }),
        init: OnceCell::new(),
        writes: tx,
      }),
    }
  }

  /// The durable store behind this shim.
  pub fn store(&self) -> &S {
    &self.inner.store
  }

  pub fn state(&self) -> StorageState {
    self.inner.table().state
  }

  /// Bulk-load every durable key into memory.
  ///
  /// Idempotent; concurrent callers share a single load. A failed load is
  /// logged and the shim starts empty.
  pub async fn initialize(&self) {
    self
      .inner
      .init
      .get_or_init(|| async {
        self.inner.table().state = StorageState::Initializing;
        let loaded = self.load().await;

        let mut table = self.inner.table();
        match loaded {
          Ok(pairs) => {
            let total = pairs.len();
            if !table.cleared {
              for (key, value) in pairs {
                if !table.touched.contains(&key) {
                  table.items.entry(key).or_insert(value);
                }
              }
            }
            info!(loaded = total, "Local storage initialized");
          }
          Err(e) => {
            warn!("Failed to load durable storage, starting empty: {}", e);
          }
        }
        table.touched.clear();
        table.state = StorageState::Initialized;
      })
      .await;
  }

  async fn load(&self) -> color_eyre::Result<Vec<(String, String)>> {
    let keys = self.inner.store.get_all_keys().await?;
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let pairs = self.inner.store.multi_get(&keys).await?;
    Ok(
      pairs
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect(),
    )
  }

  pub fn get_item(&self, key: &str) -> Option<String> {
    self.inner.table().items.get(key).cloned()
  }

  pub fn set_item(&self, key: &str, value: &str) {
    {
      let mut table = self.inner.table();
      table.items.insert(key.to_string(), value.to_string());
      if table.state != StorageState::Initialized {
        table.touched.insert(key.to_string());
      }
    }
    self
      .inner
      .enqueue(WriteOp::Set(key.to_string(), value.to_string()));
  }

  pub fn remove_item(&self, key: &str) {
    {
      let mut table = self.inner.table();
      table.items.remove(key);
      if table.state != StorageState::Initialized {
        table.touched.insert(key.to_string());
      }
    }
    self.inner.enqueue(WriteOp::Remove(key.to_string()));
  }

  pub fn clear(&self) {
    {
      let mut table = self.inner.table();
      table.items.clear();
      if table.state != StorageState::Initialized {
        table.cleared = true;
      }
    }
    self.inner.enqueue(WriteOp::Clear);
  }

  /// Name of the key at `index`, in key order.
  pub fn key(&self, index: usize) -> Option<String> {
    self.inner.table().items.keys().nth(index).cloned()
  }

  pub fn length(&self) -> usize {
    self.inner.table().items.len()
  }

  pub fn keys(&self) -> Vec<String> {
    self.inner.table().items.keys().cloned().collect()
  }

  /// Wait until every write issued so far has reached the durable store
  /// (or failed and been logged).
  pub async fn flush(&self) {
    let (tx, rx) = oneshot::channel();
    self.inner.enqueue(WriteOp::Flush(tx));
    let _ = rx.await;
  }
}

impl<S> Clone for LocalStorage<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Apply queued writes one at a time so the durable store sees them in order.
async fn run_writer<S: DurableStore>(store: Arc<S>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
  while let Some(op) = rx.recv().await {
    let result = match op {
      WriteOp::Set(key, value) => store
        .set_item(&key, &value)
        .await
        .map_err(|e| (format!("set '{}'", key), e)),
      WriteOp::Remove(key) => store
        .remove_item(&key)
        .await
        .map_err(|e| (format!("remove '{}'", key), e)),
      WriteOp::Clear => store.clear().await.map_err(|e| ("clear".to_string(), e)),
      WriteOp::Flush(done) => {
        let _ = done.send(());
        Ok(())
      }
    };

    if let Err((what, e)) = result {
      warn!("Durable storage write failed ({}): {}", what, e);
    }
  }
  debug!("Storage writer stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::testing::MemoryStore;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  #[tokio::test]
  async fn test_set_is_visible_before_durable_write() {
    let storage = LocalStorage::new(MemoryStore::with_delay(Duration::from_millis(200)));
    storage.initialize().await;

    storage.set_item("token", "abc");
    assert_eq!(storage.get_item("token"), Some("abc".to_string()));
    assert!(storage.store().snapshot().is_empty());

    storage.flush().await;
    assert_eq!(
      storage.store().snapshot().get("token"),
      Some(&"abc".to_string())
    );
  }

  #[tokio::test]
  async fn test_clear_empties_everything() {
    let storage = LocalStorage::new(MemoryStore::default());
    storage.initialize().await;

    storage.set_item("a", "1");
    storage.set_item("b", "2");
    storage.clear();

    assert_eq!(storage.get_item("a"), None);
    assert_eq!(storage.get_item("b"), None);
    assert_eq!(storage.length(), 0);

    storage.flush().await;
    assert!(storage.store().snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_initialize_loads_once() {
    let store = MemoryStore::seeded(&[("user", "ana"), ("theme", "dark")]);
    let storage = LocalStorage::new(MemoryStore {
      delay: Duration::from_millis(50),
      ..store
    });

    let (a, b) = (storage.clone(), storage.clone());
    tokio::join!(a.initialize(), b.initialize(), storage.initialize());
    storage.initialize().await;

    assert_eq!(storage.store().get_all_keys_calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.store().multi_get_calls.load(Ordering::SeqCst), 1);
    assert_eq!(storage.get_item("user"), Some("ana".to_string()));
    assert_eq!(storage.state(), StorageState::Initialized);
  }

  #[tokio::test]
  async fn test_reads_miss_before_initialize() {
    let storage = LocalStorage::new(MemoryStore::seeded(&[("user", "ana")]));
    assert_eq!(storage.state(), StorageState::Uninitialized);
    assert_eq!(storage.get_item("user"), None);

    storage.initialize().await;
    assert_eq!(storage.get_item("user"), Some("ana".to_string()));
  }

  #[tokio::test]
  async fn test_failed_load_fails_open() {
    let store = MemoryStore::seeded(&[("user", "ana")]);
    store.fail_reads.store(true, Ordering::SeqCst);
    let storage = LocalStorage::new(store);

    storage.initialize().await;
    assert_eq!(storage.state(), StorageState::Initialized);
    assert_eq!(storage.length(), 0);

    storage.set_item("k", "v");
    assert_eq!(storage.get_item("k"), Some("v".to_string()));
  }

  #[tokio::test]
  async fn test_write_failures_are_swallowed() {
    let store = MemoryStore::default();
    store.fail_writes.store(true, Ordering::SeqCst);
    let storage = LocalStorage::new(store);
    storage.initialize().await;

    storage.set_item("k", "v");
    storage.remove_item("missing");
    storage.flush().await;

    assert_eq!(storage.get_item("k"), Some("v".to_string()));
    assert_eq!(storage.store().write_calls.load(Ordering::SeqCst), 2);
    assert!(storage.store().snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_writes_during_initialization_win_over_loaded_data() {
    let storage = LocalStorage::new(MemoryStore {
      delay: Duration::from_millis(50),
      ..MemoryStore::seeded(&[("a", "durable"), ("b", "durable"), ("c", "durable")])
    });

    let init = {
      let storage = storage.clone();
      tokio::spawn(async move { storage.initialize().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(storage.state(), StorageState::Initializing);

    storage.set_item("a", "memory");
    storage.remove_item("b");
    init.await.unwrap();

    assert_eq!(storage.get_item("a"), Some("memory".to_string()));
    assert_eq!(storage.get_item("b"), None);
    assert_eq!(storage.get_item("c"), Some("durable".to_string()));
  }

  #[tokio::test]
  async fn test_key_and_length_follow_key_order() {
    let storage = LocalStorage::new(MemoryStore::default());
    storage.initialize().await;

    storage.set_item("b", "2");
    storage.set_item("a", "1");
    storage.set_item("a", "3");

    assert_eq!(storage.length(), 2);
    assert_eq!(storage.key(0), Some("a".to_string()));
    assert_eq!(storage.key(1), Some("b".to_string()));
    assert_eq!(storage.key(2), None);
    assert_eq!(storage.keys(), vec!["a".to_string(), "b".to_string()]);
  }

  #[tokio::test]
  async fn test_durable_store_sees_writes_in_order() {
    let storage = LocalStorage::new(MemoryStore::with_delay(Duration::from_millis(5)));
    storage.initialize().await;

    storage.set_item("k", "1");
    storage.set_item("k", "2");
    storage.remove_item("k");
    storage.set_item("k", "3");
    storage.flush().await;

    assert_eq!(
      storage.store().snapshot().get("k"),
      Some(&"3".to_string())
    );
  }
}
