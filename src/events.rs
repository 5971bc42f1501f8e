use serde::Serialize;
use tokio::sync::broadcast;

/// Runtime notifications for whoever is listening (UI banners, logs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
  /// Connectivity flipped
  ConnectivityChanged { connected: bool },
  /// A flush pass over the mutation queue completed
  QueueFlushed { flushed: usize, remaining: usize },
  /// The server rejected the credential; the session was cleared
  ReauthRequired,
  /// A manual branding refresh finished
  BrandingRefreshed { scope: String, updated: usize },
}

/// Fire-and-forget publish/subscribe emitter.
///
/// Emitting with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<Event>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn emit(&self, event: Event) {
    tracing::debug!(?event, "emit");
    // Err only means nobody is subscribed
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
