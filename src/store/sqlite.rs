//! SQLite-backed durable store.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{KeyValueStore, StoreError};

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable store kept in a single SQLite database file.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened store");
    Ok(store)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let store = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let conn = self.lock()?;
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    // substr comparison sidesteps LIKE wildcards inside the prefix
    let mut stmt = conn.prepare(
      "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}
