//! Cache layer on top of the durable store.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::entry::CacheEntry;
use crate::store::{self, KeyValueStore, StoreError};

const PREFIX: &str = "cache:";

/// Scoped map of request signature to last successful response.
#[derive(Clone)]
pub struct ReadThroughCache {
  store: Arc<dyn KeyValueStore>,
}

impl ReadThroughCache {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  fn scope_prefix(scope: &str) -> String {
    format!("{}{}:", PREFIX, store::key_segment(scope))
  }

  /// Store key for an entry. SHA256 keeps keys fixed-length whatever the query.
  fn storage_key(scope: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{}{}", Self::scope_prefix(scope), hex::encode(hasher.finalize()))
  }

  /// Insert or overwrite the entry for (scope, key).
  pub fn put(&self, scope: &str, key: &str, value: Value) -> Result<(), StoreError> {
    let entry = CacheEntry {
      scope: scope.to_string(),
      key: key.to_string(),
      value,
      updated_at: Utc::now(),
    };
    store::set_json(self.store.as_ref(), &Self::storage_key(scope, key), &entry)
  }

  /// Full entry for (scope, key), or `None`.
  pub fn entry(&self, scope: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let entry: Option<CacheEntry> =
      store::get_json(self.store.as_ref(), &Self::storage_key(scope, key))?;
    // Guard against digest collisions by checking the stored signature
    Ok(entry.filter(|e| e.scope == scope && e.key == key))
  }

  /// Cached value for (scope, key). Storage failures read as a miss.
  pub fn get(&self, scope: &str, key: &str) -> Option<Value> {
    match self.entry(scope, key) {
      Ok(entry) => entry.map(|e| e.value),
      Err(e) => {
        tracing::warn!(scope, key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Delete every entry of `scope`. Returns how many were removed.
  pub fn purge(&self, scope: &str) -> Result<usize, StoreError> {
    let keys = self.store.keys(&Self::scope_prefix(scope))?;
    for key in &keys {
      self.store.remove(key)?;
    }
    tracing::info!(scope, removed = keys.len(), "purged cache scope");
    Ok(keys.len())
  }
}
