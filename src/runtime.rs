//! Long-lived context that owns every component and its background tasks.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::branding::AssetSynchronizer;
use crate::cache::ReadThroughCache;
use crate::cancel::CancellationGroup;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatch::Dispatcher;
use crate::events::EventBus;
use crate::http::{HttpTransport, Transport};
use crate::queue::{FlushOutcome, MutationQueue};
use crate::session::{ReauthGate, SessionStore};
use crate::store::{KeyValueStore, SqliteStore};

pub struct Runtime {
  config: Config,
  events: EventBus,
  monitor: Arc<ConnectivityMonitor>,
  cache: ReadThroughCache,
  queue: Arc<MutationQueue>,
  group: CancellationGroup,
  session: SessionStore,
  dispatcher: Arc<Dispatcher>,
  branding: AssetSynchronizer,
  shutdown: watch::Sender<bool>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
  /// Open the durable store and HTTP transport named by `config`.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.store_path()?;
    let store = SqliteStore::open(&path)
      .map_err(|e| eyre!("Failed to open store {}: {}", path.display(), e))?;
    let transport = HttpTransport::new(&config.api.base_url, config.request_timeout())
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let runtime = Self::with_parts(config, Arc::new(store), Arc::new(transport))?;

    // Environment token only seeds an empty session
    if let Some(token) = Config::get_token() {
      if runtime.session.token()?.is_none() {
        runtime.session.set_token(&token)?;
        tracing::info!("session seeded from FLEETSYNC_TOKEN");
      }
    }
    Ok(runtime)
  }

  /// Wire components over an existing store and transport.
  pub fn with_parts(
    config: Config,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let events = EventBus::default();
    let monitor = Arc::new(ConnectivityMonitor::new(
      transport.clone(),
      &config.connectivity.probe_path,
      config.probe_timeout(),
      events.clone(),
    ));
    let cache = ReadThroughCache::new(store.clone());
    let queue = Arc::new(MutationQueue::new(store.clone(), events.clone()));
    let group = CancellationGroup::new();
    let session = SessionStore::new(store.clone());
    let reauth = ReauthGate::new(session.clone(), events.clone(), config.reauth_debounce());

    let dispatcher = Arc::new(Dispatcher::new(
      transport,
      monitor.clone(),
      cache.clone(),
      queue.clone(),
      group.clone(),
      session.clone(),
      reauth,
    ));

    let branding = AssetSynchronizer::new(
      dispatcher.clone(),
      store,
      events.clone(),
      &config.branding.path,
      config.branding.assets.iter().cloned().collect(),
      config.branding_dir()?,
    );

    let (shutdown, _rx) = watch::channel(false);

    Ok(Self {
      config,
      events,
      monitor,
      cache,
      queue,
      group,
      session,
      dispatcher,
      branding,
      shutdown,
      tasks: Mutex::new(Vec::new()),
    })
  }

  /// Spawn connectivity polling and the queue flush triggers.
  ///
  /// Calling it again while tasks are running does nothing.
  pub fn start(&self) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    if !tasks.is_empty() {
      return;
    }

    let monitor = self.monitor.clone();
    let interval = self.config.probe_interval();
    let shutdown = self.shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
      monitor.run(interval, shutdown).await;
    }));

    tasks.push(tokio::spawn(flush_on_reconnect(
      self.monitor.subscribe(),
      self.dispatcher.clone(),
      self.shutdown.subscribe(),
    )));

    tasks.push(tokio::spawn(flush_periodically(
      self.monitor.clone(),
      self.queue.clone(),
      self.dispatcher.clone(),
      self.config.flush_interval(),
      self.shutdown.subscribe(),
    )));

    tracing::info!(scope = %self.config.api.scope, "runtime started");
  }

  /// Stop background tasks and wait for them to exit.
  pub async fn shutdown(&self) {
    self.shutdown.send_replace(true);
    let handles: Vec<_> = self
      .tasks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .drain(..)
      .collect();
    for handle in handles {
      if let Err(e) = handle.await {
        tracing::warn!(error = %e, "background task ended abnormally");
      }
    }
    tracing::info!("runtime stopped");
  }

  pub fn login(&self, token: &str) -> Result<()> {
    if token.trim().is_empty() {
      return Err(eyre!("token must not be empty"));
    }
    if token.chars().any(char::is_control) {
      return Err(eyre!("token must not contain control characters"));
    }
    self.session.set_token(token)?;
    tracing::info!("signed in");
    Ok(())
  }

  /// Abort in-flight calls, drop the scope's cached reads and sign out.
  ///
  /// Queued mutations are kept and replay under the next session.
  pub fn logout(&self) -> Result<()> {
    let cancelled = self.group.cancel_all("logout");
    let purged = self.cache.purge(&self.config.api.scope)?;
    self.session.clear()?;
    tracing::info!(cancelled, purged, "signed out");
    Ok(())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn scope(&self) -> &str {
    &self.config.api.scope
  }

  pub fn dispatcher(&self) -> Arc<Dispatcher> {
    self.dispatcher.clone()
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn cache(&self) -> &ReadThroughCache {
    &self.cache
  }

  pub fn session(&self) -> &SessionStore {
    &self.session
  }

  pub fn branding(&self) -> &AssetSynchronizer {
    &self.branding
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }
}

async fn flush_logged(dispatcher: &Dispatcher, trigger: &str) {
  match dispatcher.flush().await {
    Ok(FlushOutcome::Completed(report)) => {
      tracing::debug!(trigger, flushed = report.flushed, remaining = report.remaining, "flush finished");
    }
    Ok(FlushOutcome::Coalesced) => {
      tracing::debug!(trigger, "flush joined a pass already running");
    }
    Err(e) => tracing::warn!(trigger, error = %e, "flush failed"),
  }
}

async fn flush_on_reconnect(
  mut states: watch::Receiver<crate::connectivity::ConnectivityState>,
  dispatcher: Arc<Dispatcher>,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut was_connected = states.borrow_and_update().is_connected;
  loop {
    tokio::select! {
      changed = states.changed() => {
        if changed.is_err() {
          break;
        }
      }
      _ = shutdown.changed() => break,
    }

    let connected = states.borrow_and_update().is_connected;
    if connected && !was_connected {
      tracing::info!("connectivity restored, replaying queue");
      flush_logged(&dispatcher, "reconnect").await;
    }
    was_connected = connected;
  }
}

async fn flush_periodically(
  monitor: Arc<ConnectivityMonitor>,
  queue: Arc<MutationQueue>,
  dispatcher: Arc<Dispatcher>,
  period: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let start = tokio::time::Instant::now() + period;
  let mut ticker = tokio::time::interval_at(start, period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let pending = match queue.is_empty() {
          Ok(empty) => !empty,
          Err(e) => {
            tracing::warn!(error = %e, "could not read queue");
            false
          }
        };
        if pending && monitor.is_connected() {
          flush_logged(&dispatcher, "interval").await;
        }
      }
      _ = shutdown.changed() => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dispatch::DispatchError;
  use crate::events::Event;
  use crate::http::mock::MockTransport;
  use crate::http::{Method, RequestSpec, Response};
  use crate::store::MemoryStore;
  use serde_json::json;

  struct Fixture {
    runtime: Runtime,
    transport: MockTransport,
    _dir: tempfile::TempDir,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::from_yaml(&format!(
      r#"
api:
  base_url: https://api.example.com
  scope: school-9
auth:
  reauth_debounce_ms: 50
branding:
  directory: {}
"#,
      dir.path().display()
    ))
    .unwrap();
    let transport = MockTransport::new();
    let runtime = Runtime::with_parts(
      config,
      Arc::new(MemoryStore::new()),
      Arc::new(transport.clone()),
    )
    .unwrap();
    Fixture {
      runtime,
      transport,
      _dir: dir,
    }
  }

  #[tokio::test]
  async fn test_reconnect_replays_queue() {
    let f = fixture();
    let mut events = f.runtime.events().subscribe();

    f.transport.set_online(false);
    let reply = f
      .runtime
      .dispatcher()
      .dispatch(RequestSpec::post("/attendance", json!({"studentId": "S1"})))
      .await
      .unwrap();
    assert!(reply.is_queued_offline());
    assert_eq!(f.runtime.queue().len().unwrap(), 1);

    f.runtime.start();
    f.transport.set_online(true);
    f.runtime.monitor().report(true);

    let flushed = tokio::time::timeout(Duration::from_secs(2), async {
      loop {
        if let Ok(Event::QueueFlushed { flushed, remaining }) = events.recv().await {
          return (flushed, remaining);
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(flushed, (1, 0));
    assert!(f.runtime.queue().is_empty().unwrap());
    assert_eq!(f.transport.sent_to("/attendance").len(), 1);
    f.runtime.shutdown().await;
  }

  #[tokio::test]
  async fn test_login_attaches_token() {
    let f = fixture();
    f.runtime.login("abc").unwrap();
    f.runtime
      .dispatcher()
      .dispatch(RequestSpec::get("/routes"))
      .await
      .unwrap();

    let sent = f.transport.sent_to("/routes");
    assert_eq!(sent[0].header("Authorization"), Some("Bearer abc"));
    assert!(f.runtime.login("  ").is_err());
    assert!(f.runtime.login("Bearer a\nb").is_err());
    assert_eq!(f.runtime.session().token().unwrap().as_deref(), Some("abc"));
  }

  #[tokio::test]
  async fn test_logout_aborts_purges_and_signs_out() {
    let f = fixture();
    f.runtime.login("abc").unwrap();
    f.runtime
      .cache()
      .put("school-9", "/routes|{}", json!(["R1"]))
      .unwrap();
    f.runtime
      .queue()
      .enqueue(RequestSpec::post("/attendance", json!({"studentId": "S1"})))
      .unwrap();
    f.transport.delay("/slow", Duration::from_millis(500));

    let dispatcher = f.runtime.dispatcher();
    let call = tokio::spawn(async move { dispatcher.dispatch(RequestSpec::get("/slow")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    f.runtime.logout().unwrap();

    match call.await.unwrap() {
      Err(DispatchError::Aborted { reason }) => assert_eq!(reason, "logout"),
      other => panic!("expected abort, got {:?}", other),
    }
    assert!(f.runtime.cache().get("school-9", "/routes|{}").is_none());
    assert!(f.runtime.session().token().unwrap().is_none());
    assert_eq!(f.runtime.queue().len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_periodic_tick_skips_empty_queue() {
    let f = fixture();
    f.transport.respond(Method::Get, "/health", Response::new(200, json!({})));
    f.runtime.start();
    f.runtime.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(f.runtime.monitor().is_connected());
    assert!(f.transport.sent_to("/attendance").is_empty());
    f.runtime.shutdown().await;
    assert!(f.runtime.tasks.lock().unwrap().is_empty());
  }
}
