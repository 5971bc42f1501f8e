//! Durable key-value storage.
//!
//! Every component owns a disjoint key namespace inside one store:
//! - `queue:pending` for the mutation queue
//! - `cache:<scope>:<digest>` for read-through cache entries
//! - `branding:<scope>:<kind>` for branding asset metadata
//! - `session:token` for the current credential
//!
//! Operations are individually atomic; there are no cross-key transactions.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The underlying database failed.
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// A stored value could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Filesystem failure while preparing the store location.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A lock guarding the backend was poisoned by a panicking holder.
  #[error("lock poisoned: {0}")]
  Poisoned(String),
}

/// Generic persistent string store.
pub trait KeyValueStore: Send + Sync {
  /// Read a value, `None` when the key is absent.
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Write (or overwrite) a value.
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  /// Delete a key. Deleting an absent key is not an error.
  fn remove(&self, key: &str) -> Result<(), StoreError>;

  /// List every key starting with `prefix`, in lexical order.
  fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Read a JSON-encoded value.
pub fn get_json<T: serde::de::DeserializeOwned>(
  store: &dyn KeyValueStore,
  key: &str,
) -> Result<Option<T>, StoreError> {
  match store.get(key)? {
    Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
    None => Ok(None),
  }
}

/// Write a value as JSON.
pub fn set_json<T: serde::Serialize>(
  store: &dyn KeyValueStore,
  key: &str,
  value: &T,
) -> Result<(), StoreError> {
  let raw = serde_json::to_string(value)?;
  store.set(key, &raw)
}

/// Encode a scope for use as one segment of a store key.
///
/// Form encoding escapes `:` so `a` and `a:b` never share a prefix.
pub fn key_segment(scope: &str) -> String {
  url::form_urlencoded::byte_serialize(scope.as_bytes()).collect()
}
