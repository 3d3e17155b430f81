//! SQLite implementation of the durable key-value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::DurableStore;

/// SQLite-based durable store.
///
/// Blocking database calls run on tokio's blocking pool.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }
}

/// Schema for the key-value table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  async fn get_item(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read '{}': {}", key, e))
      })
      .await
  }

  async fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let (key, value) = (key.to_string(), value.to_string());
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
          )
          .map_err(|e| eyre!("Failed to write '{}': {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn remove_item(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM kv_store WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to remove '{}': {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn get_all_keys(&self) -> Result<Vec<String>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT key FROM kv_store ORDER BY key")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let keys = stmt
          .query_map([], |row| row.get(0))
          .map_err(|e| eyre!("Failed to list keys: {}", e))?
          .collect::<rusqlite::Result<Vec<String>>>()
          .map_err(|e| eyre!("Failed to read key: {}", e))?;

        Ok(keys)
      })
      .await
  }

  async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
    let keys = keys.to_vec();
    self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare("SELECT value FROM kv_store WHERE key = ?")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
          let value: Option<String> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()
            .map_err(|e| eyre!("Failed to read '{}': {}", key, e))?;
          values.push((key, value));
        }

        Ok(values)
      })
      .await
  }

  async fn clear(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .execute("DELETE FROM kv_store", [])
          .map_err(|e| eyre!("Failed to clear storage: {}", e))?;
        Ok(())
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_get_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get_item("token").await.unwrap(), None);

    store.set_item("token", "abc").await.unwrap();
    store.set_item("token", "def").await.unwrap();
    assert_eq!(store.get_item("token").await.unwrap(), Some("def".to_string()));

    store.remove_item("token").await.unwrap();
    assert_eq!(store.get_item("token").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_bulk_reads() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set_item("b", "2").await.unwrap();
    store.set_item("a", "1").await.unwrap();

    let keys = store.get_all_keys().await.unwrap();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

    let values = store
      .multi_get(&["a".to_string(), "missing".to_string()])
      .await
      .unwrap();
    assert_eq!(
      values,
      vec![
        ("a".to_string(), Some("1".to_string())),
        ("missing".to_string(), None),
      ]
    );

    store.clear().await.unwrap();
    assert!(store.get_all_keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("storage.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set_item("user", "ana").await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get_item("user").await.unwrap(), Some("ana".to_string()));
  }
}
