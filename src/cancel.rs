//! Registry of in-flight calls that can be aborted together (e.g. on logout).
//!
//! Cancellation is cooperative: each call races its work against
//! [`InFlight::cancelled`]. The transport may still deliver the request; the
//! response is ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct Registry {
  next_id: u64,
  handles: HashMap<u64, watch::Sender<Option<String>>>,
}

/// Group of abortable calls.
#[derive(Debug, Clone, Default)]
pub struct CancellationGroup {
  registry: Arc<Mutex<Registry>>,
}

/// Abort handle for one outstanding call. Unregisters itself when dropped.
#[derive(Debug)]
pub struct InFlight {
  id: u64,
  signal: watch::Receiver<Option<String>>,
  registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
  // Registry holds no invariants a panicking holder could break
  registry.lock().unwrap_or_else(|e| e.into_inner())
}

impl CancellationGroup {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new call.
  pub fn register(&self) -> InFlight {
    let (tx, rx) = watch::channel(None);
    let mut registry = lock(&self.registry);
    let id = registry.next_id;
    registry.next_id += 1;
    registry.handles.insert(id, tx);

    InFlight {
      id,
      signal: rx,
      registry: Arc::clone(&self.registry),
    }
  }

  /// Signal abort to every registered call and clear the registry.
  ///
  /// Returns how many calls were signalled; zero when nothing is in flight.
  pub fn cancel_all(&self, reason: &str) -> usize {
    let handles: Vec<_> = lock(&self.registry).handles.drain().collect();
    for (_, tx) in &handles {
      tx.send_replace(Some(reason.to_string()));
    }
    if !handles.is_empty() {
      tracing::info!(count = handles.len(), reason, "cancelled in-flight calls");
    }
    handles.len()
  }

  pub fn len(&self) -> usize {
    lock(&self.registry).handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl InFlight {
  /// Resolves with the reason once the call is aborted.
  pub async fn cancelled(&self) -> String {
    let mut signal = self.signal.clone();
    loop {
      let current = signal.borrow_and_update().clone();
      if let Some(reason) = current {
        return reason;
      }
      if signal.changed().await.is_err() {
        // Sender gone without a signal: this call can no longer be aborted
        std::future::pending::<()>().await;
      }
    }
  }

  /// Abort reason, if the call was aborted.
  pub fn reason(&self) -> Option<String> {
    self.signal.borrow().clone()
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    lock(&self.registry).handles.remove(&self.id);
  }
}
