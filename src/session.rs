//! Credential holder and the debounced re-authentication signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{Event, EventBus};
use crate::store::{KeyValueStore, StoreError};

const TOKEN_KEY: &str = "session:token";

/// Reads and writes the current credential in the durable store.
#[derive(Clone)]
pub struct SessionStore {
  store: Arc<dyn KeyValueStore>,
}

impl SessionStore {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// Current token, `None` when signed out.
  pub fn token(&self) -> Result<Option<String>, StoreError> {
    Ok(self.store.get(TOKEN_KEY)?.filter(|t| !t.is_empty()))
  }

  pub fn set_token(&self, token: &str) -> Result<(), StoreError> {
    self.store.set(TOKEN_KEY, token)
  }

  pub fn clear(&self) -> Result<(), StoreError> {
    self.store.remove(TOKEN_KEY)
  }
}

/// Clears the session when the server rejects the credential and tells
/// listeners to re-authenticate, at most once per debounce window.
pub struct ReauthGate {
  session: SessionStore,
  events: EventBus,
  window: Duration,
  last_fired: Mutex<Option<Instant>>,
}

impl ReauthGate {
  pub fn new(session: SessionStore, events: EventBus, window: Duration) -> Self {
    Self {
      session,
      events,
      window,
      last_fired: Mutex::new(None),
    }
  }

  /// Handle one auth rejection. Returns true if the signal fired.
  pub fn reject(&self) -> bool {
    if let Err(e) = self.session.clear() {
      tracing::warn!(error = %e, "failed to clear session after auth rejection");
    }

    let now = Instant::now();
    let fire = {
      let mut last = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
      match *last {
        Some(at) if now.duration_since(at) < self.window => false,
        _ => {
          *last = Some(now);
          true
        }
      }
    };

    if fire {
      tracing::warn!("credential rejected, re-authentication required");
      self.events.emit(Event::ReauthRequired);
    }
    fire
  }
}
