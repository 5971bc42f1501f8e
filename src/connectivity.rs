//! Best-effort connectivity tracking.
//!
//! State is fed from two sources: a native reachability signal pushed through
//! [`ConnectivityMonitor::report`], and liveness probes against the server.
//! Probes never fail; they only update state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::events::{Event, EventBus};
use crate::http::{RequestSpec, Transport};

/// Snapshot of the connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub is_connected: bool,
  pub last_change_at: DateTime<Utc>,
}

pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  probe: RequestSpec,
  probe_timeout: Duration,
  state: watch::Sender<ConnectivityState>,
  events: EventBus,
}

impl ConnectivityMonitor {
  /// Create a monitor that probes `probe_path`. Starts disconnected.
  pub fn new(
    transport: Arc<dyn Transport>,
    probe_path: &str,
    probe_timeout: Duration,
    events: EventBus,
  ) -> Self {
    let (state, _rx) = watch::channel(ConnectivityState {
      is_connected: false,
      last_change_at: Utc::now(),
    });
    Self {
      transport,
      probe: RequestSpec::get(probe_path),
      probe_timeout,
      state,
      events,
    }
  }

  /// Current snapshot.
  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn is_connected(&self) -> bool {
    self.state.borrow().is_connected
  }

  /// Receiver that wakes on every connectivity change.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  /// Record an observation. Returns true when the state flipped.
  pub fn report(&self, connected: bool) -> bool {
    let changed = self.state.send_if_modified(|state| {
      if state.is_connected == connected {
        return false;
      }
      state.is_connected = connected;
      state.last_change_at = Utc::now();
      true
    });

    if changed {
      if connected {
        tracing::info!("connectivity restored");
      } else {
        tracing::warn!("connectivity lost");
      }
      self.events.emit(Event::ConnectivityChanged { connected });
    }
    changed
  }

  /// Probe the liveness endpoint once and update state.
  ///
  /// Any server response counts as connected; transport failure or timeout
  /// counts as disconnected.
  pub async fn probe(&self) -> bool {
    let connected = match tokio::time::timeout(self.probe_timeout, self.transport.send(&self.probe))
      .await
    {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        tracing::debug!(error = %e, "liveness probe failed");
        false
      }
      Err(_) => {
        tracing::debug!(timeout = ?self.probe_timeout, "liveness probe timed out");
        false
      }
    };
    self.report(connected);
    connected
  }

  /// Probe every `interval` until `shutdown` flips to true.
  pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      if *shutdown.borrow() {
        break;
      }
      tokio::select! {
        _ = ticker.tick() => {
          self.probe().await;
        }
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    tracing::debug!("connectivity polling stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::mock::MockTransport;
  use crate::http::{Method, Response};

  fn monitor(transport: &MockTransport) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      Arc::new(transport.clone()),
      "/health",
      Duration::from_millis(50),
      EventBus::default(),
    )
  }

  #[tokio::test]
  async fn test_probe_updates_state() {
    let transport = MockTransport::new();
    let monitor = monitor(&transport);
    assert!(!monitor.state().is_connected);

    assert!(monitor.probe().await);
    assert!(monitor.is_connected());

    transport.set_online(false);
    assert!(!monitor.probe().await);
    assert!(!monitor.is_connected());
  }

  #[tokio::test]
  async fn test_error_status_still_counts_as_connected() {
    let transport = MockTransport::new();
    transport.respond(Method::Get, "/health", Response::new(503, serde_json::Value::Null));
    let monitor = monitor(&transport);

    assert!(monitor.probe().await);
  }

  #[tokio::test]
  async fn test_probe_timeout_means_disconnected() {
    let transport = MockTransport::new();
    transport.delay("/health", Duration::from_secs(5));
    let monitor = monitor(&transport);
    monitor.report(true);

    assert!(!monitor.probe().await);
    assert!(!monitor.is_connected());
  }

  #[tokio::test]
  async fn test_report_emits_only_on_change() {
    let transport = MockTransport::new();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let monitor = ConnectivityMonitor::new(
      Arc::new(transport.clone()),
      "/health",
      Duration::from_millis(50),
      events,
    );

    let before = monitor.state().last_change_at;
    assert!(!monitor.report(false));
    assert!(monitor.report(true));
    assert!(!monitor.report(true));
    assert!(monitor.state().last_change_at >= before);

    assert_eq!(
      rx.recv().await.unwrap(),
      Event::ConnectivityChanged { connected: true }
    );
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_subscribers_see_changes() {
    let transport = MockTransport::new();
    let monitor = monitor(&transport);
    let mut rx = monitor.subscribe();

    monitor.probe().await;
    rx.changed().await.unwrap();
    assert!(rx.borrow().is_connected);
  }
}
