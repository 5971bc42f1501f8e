//! Single entry point for every remote call.
//!
//! The dispatcher decides between the online and offline paths and is the
//! only place where raw transport outcomes are classified. Callers see a
//! [`Reply`] or one of the [`DispatchError`] variants, never a transport
//! error.
//!
//! ```text
//!                 ┌─ offline ─┬─ mutation → MutationQueue → 202 {offline: true}
//! dispatch(req) ──┤           └─ read     → ReadThroughCache → cached | Unavailable
//!                 └─ online ──── Transport (auth attached, abortable)
//!                                 ├─ 2xx read → write-through cache
//!                                 ├─ 401      → clear session, re-auth signal
//!                                 └─ no response → offline path
//! ```

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{self, ReadThroughCache};
use crate::cancel::CancellationGroup;
use crate::connectivity::ConnectivityMonitor;
use crate::http::{RequestSpec, Response, Transport, TransportError};
use crate::queue::{FlushOutcome, MutationQueue};
use crate::session::{ReauthGate, SessionStore};
use crate::store::StoreError;

/// Status the server uses to reject an invalid or expired credential.
const AUTH_REJECTED: u16 = 401;

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
  Network,
  /// Offline read answered from the local cache
  Cache,
  /// Mutation accepted offline, pending sync
  QueuedOffline,
}

/// Successful outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
  pub status: u16,
  pub data: Value,
  pub source: ReplySource,
}

impl Reply {
  fn network(response: Response) -> Self {
    Self {
      status: response.status,
      data: response.body,
      source: ReplySource::Network,
    }
  }

  fn cached(data: Value) -> Self {
    Self {
      status: 200,
      data,
      source: ReplySource::Cache,
    }
  }

  /// The offline-accepted marker.
  fn queued_offline() -> Self {
    Self {
      status: 202,
      data: json!({ "offline": true }),
      source: ReplySource::QueuedOffline,
    }
  }

  /// Whether the mutation was queued rather than delivered.
  pub fn is_queued_offline(&self) -> bool {
    self.source == ReplySource::QueuedOffline
  }
}

#[derive(Debug, Error)]
pub enum DispatchError {
  /// No response could be obtained and nothing is cached for this read.
  #[error("offline and no cached response for {signature}")]
  Unavailable { signature: String },

  /// The server rejected the credential.
  #[error("credential rejected (status {status})")]
  AuthenticationRejected { status: u16 },

  /// Well-formed error response; surfaced as-is and never retried.
  #[error("request failed with status {status}")]
  Application { status: u16, body: Value },

  /// Aborted through the cancellation group.
  #[error("request aborted: {reason}")]
  Aborted { reason: String },

  /// The request could not be built (bad path, header or body). Never queued.
  #[error("invalid request: {reason}")]
  InvalidRequest { reason: String },

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub struct Dispatcher {
  transport: Arc<dyn Transport>,
  monitor: Arc<ConnectivityMonitor>,
  cache: ReadThroughCache,
  queue: Arc<MutationQueue>,
  group: CancellationGroup,
  session: SessionStore,
  reauth: ReauthGate,
}

impl Dispatcher {
  pub fn new(
    transport: Arc<dyn Transport>,
    monitor: Arc<ConnectivityMonitor>,
    cache: ReadThroughCache,
    queue: Arc<MutationQueue>,
    group: CancellationGroup,
    session: SessionStore,
    reauth: ReauthGate,
  ) -> Self {
    Self {
      transport,
      monitor,
      cache,
      queue,
      group,
      session,
      reauth,
    }
  }

  /// Dispatch one request along the online or offline path.
  pub async fn dispatch(&self, request: RequestSpec) -> Result<Reply, DispatchError> {
    let signature = cache::signature(&request);
    tracing::debug!(method = %request.method, path = %request.path, "dispatch");

    // Fresh check; the monitor's last poll may be stale
    if !self.monitor.probe().await {
      return self.offline(request, signature);
    }

    let outcome = {
      let in_flight = self.group.register();
      let prepared = self.with_auth(request.clone());
      tokio::select! {
        biased;
        reason = in_flight.cancelled() => {
          tracing::debug!(path = %request.path, %reason, "dispatch aborted");
          return Err(DispatchError::Aborted { reason });
        }
        outcome = self.transport.send(&prepared) => outcome,
      }
    };

    match outcome {
      Err(TransportError::InvalidRequest(reason)) => {
        tracing::warn!(path = %request.path, %reason, "request could not be built");
        Err(DispatchError::InvalidRequest { reason })
      }
      Err(e) => {
        tracing::warn!(path = %request.path, error = %e, "no response, falling back to offline path");
        self.monitor.report(false);
        self.offline(request, signature)
      }
      Ok(response) if response.status == AUTH_REJECTED => {
        self.reauth.reject();
        Err(DispatchError::AuthenticationRejected {
          status: response.status,
        })
      }
      Ok(response) if !response.is_success() => Err(DispatchError::Application {
        status: response.status,
        body: response.body,
      }),
      Ok(response) => {
        if request.method.is_read() {
          self.write_through(&request, &signature, &response);
        }
        Ok(Reply::network(response))
      }
    }
  }

  /// Replay every queued mutation.
  pub async fn flush(&self) -> Result<FlushOutcome, DispatchError> {
    Ok(self.queue.flush_with(|request| self.replay(request)).await?)
  }

  async fn replay(&self, request: RequestSpec) -> Result<Response, TransportError> {
    let in_flight = self.group.register();
    let prepared = self.with_auth(request);
    let response = tokio::select! {
      biased;
      reason = in_flight.cancelled() => return Err(TransportError::Cancelled(reason)),
      outcome = self.transport.send(&prepared) => outcome?,
    };
    if response.status == AUTH_REJECTED {
      self.reauth.reject();
    }
    Ok(response)
  }

  /// Fetch raw asset bytes. Abortable through the cancellation group.
  pub async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
    let in_flight = self.group.register();
    tokio::select! {
      biased;
      reason = in_flight.cancelled() => Err(TransportError::Cancelled(reason)),
      bytes = self.transport.download(url) => bytes,
    }
  }

  fn offline(&self, request: RequestSpec, signature: String) -> Result<Reply, DispatchError> {
    if !request.method.is_read() {
      self.queue.enqueue(request)?;
      return Ok(Reply::queued_offline());
    }

    let cached = request
      .scope
      .as_deref()
      .and_then(|scope| self.cache.get(scope, &signature));
    match cached {
      Some(data) => Ok(Reply::cached(data)),
      None => Err(DispatchError::Unavailable { signature }),
    }
  }

  fn write_through(&self, request: &RequestSpec, signature: &str, response: &Response) {
    let Some(scope) = request.scope.as_deref() else {
      return;
    };
    if let Err(e) = self.cache.put(scope, signature, response.body.clone()) {
      tracing::warn!(scope, signature, error = %e, "cache write failed");
    }
  }

  /// Attach the session token unless the caller supplied a credential.
  fn with_auth(&self, mut request: RequestSpec) -> RequestSpec {
    if request.header("Authorization").is_some() {
      return request;
    }
    match self.session.token() {
      Ok(Some(token)) => {
        request
          .headers
          .insert("Authorization".to_string(), format!("Bearer {}", token));
      }
      Ok(None) => {}
      Err(e) => tracing::warn!(error = %e, "could not read session token"),
    }
    request
  }
}

#[cfg(test)]
impl Dispatcher {
  pub(crate) fn group(&self) -> &CancellationGroup {
    &self.group
  }

  /// Dispatcher wired to fresh components over `store`.
  pub(crate) fn for_tests(
    transport: Arc<dyn Transport>,
    store: Arc<dyn crate::store::KeyValueStore>,
    events: crate::events::EventBus,
  ) -> Self {
    let monitor = Arc::new(ConnectivityMonitor::new(
      transport.clone(),
      "/health",
      std::time::Duration::from_millis(100),
      events.clone(),
    ));
    let session = SessionStore::new(store.clone());
    let reauth = ReauthGate::new(
      session.clone(),
      events.clone(),
      std::time::Duration::from_secs(60),
    );
    Self::new(
      transport,
      monitor,
      ReadThroughCache::new(store.clone()),
      Arc::new(MutationQueue::new(store, events)),
      CancellationGroup::new(),
      session,
      reauth,
    )
  }
}
