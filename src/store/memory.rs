//! In-memory store, used for tests and throwaway sessions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{KeyValueStore, StoreError};

/// Store that keeps everything in a map; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
    self
      .entries
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
    Ok(
      self
        .lock()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}
