//! Durable FIFO of mutations issued while offline.
//!
//! Operations flow through the queue in this order:
//! 1. `enqueue()` - appended and persisted before returning
//! 2. `flush_with()` - one pass over a snapshot, strictly FIFO
//! 3. an operation leaves the queue once the server answered it, whatever
//!    the status; transport failures stay queued for the next pass, and a
//!    request that cannot even be built is discarded
//!
//! There is no backoff or retry cap: an unanswered operation is retried on
//! every future flush, and later independent operations may be delivered
//! before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::events::{Event, EventBus};
use crate::http::{RequestSpec, Response, TransportError};
use crate::store::{self, KeyValueStore, StoreError};

const QUEUE_KEY: &str = "queue:pending";

/// A mutation waiting to be replayed. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: Uuid,
  pub request: RequestSpec,
  pub enqueued_at: DateTime<Utc>,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlushReport {
  pub flushed: usize,
  pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
  /// This call ran the pass(es); report of the last pass
  Completed(FlushReport),
  /// A pass was already running; it will run once more when done
  Coalesced,
}

#[derive(Debug, Default)]
struct FlushState {
  running: bool,
  rerun: bool,
}

pub struct MutationQueue {
  store: Arc<dyn KeyValueStore>,
  events: EventBus,
  /// Serializes read-modify-write of the persisted list. Never held across an await.
  list: Mutex<()>,
  flush: Mutex<FlushState>,
}

/// Releases the running flag if a flush is dropped or fails mid-pass.
struct RunningGuard<'a> {
  state: &'a Mutex<FlushState>,
  armed: bool,
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      let mut state = lock(self.state);
      state.running = false;
      state.rerun = false;
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MutationQueue {
  pub fn new(store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
    Self {
      store,
      events,
      list: Mutex::new(()),
      flush: Mutex::new(FlushState::default()),
    }
  }

  fn load(&self) -> Result<Vec<QueuedOperation>, StoreError> {
    Ok(store::get_json(self.store.as_ref(), QUEUE_KEY)?.unwrap_or_default())
  }

  fn save(&self, ops: &[QueuedOperation]) -> Result<(), StoreError> {
    if ops.is_empty() {
      self.store.remove(QUEUE_KEY)
    } else {
      store::set_json(self.store.as_ref(), QUEUE_KEY, &ops)
    }
  }

  /// Append a mutation. The list is persisted before this returns.
  pub fn enqueue(&self, request: RequestSpec) -> Result<QueuedOperation, StoreError> {
    let op = QueuedOperation {
      id: Uuid::new_v4(),
      request,
      enqueued_at: Utc::now(),
    };

    let len = {
      let _guard = lock(&self.list);
      let mut ops = self.load()?;
      ops.push(op.clone());
      self.save(&ops)?;
      ops.len()
    };

    tracing::info!(
      method = %op.request.method,
      path = %op.request.path,
      queued = len,
      "queued mutation for later delivery"
    );
    Ok(op)
  }

  /// Pending operations in delivery order.
  pub fn pending(&self) -> Result<Vec<QueuedOperation>, StoreError> {
    let _guard = lock(&self.list);
    self.load()
  }

  pub fn len(&self) -> Result<usize, StoreError> {
    Ok(self.pending()?.len())
  }

  pub fn is_empty(&self) -> Result<bool, StoreError> {
    Ok(self.len()? == 0)
  }

  /// Replay every queued operation through `send`.
  ///
  /// Only one pass runs at a time. Calling this while a pass is running
  /// returns [`FlushOutcome::Coalesced`] and schedules one more pass after the
  /// current one finishes.
  pub async fn flush_with<F, Fut>(&self, send: F) -> Result<FlushOutcome, StoreError>
  where
    F: Fn(RequestSpec) -> Fut,
    Fut: Future<Output = Result<Response, TransportError>>,
  {
    {
      let mut state = lock(&self.flush);
      if state.running {
        state.rerun = true;
        tracing::debug!("flush already running, coalescing");
        return Ok(FlushOutcome::Coalesced);
      }
      state.running = true;
    }
    let mut guard = RunningGuard {
      state: &self.flush,
      armed: true,
    };

    loop {
      let report = self.pass(&send).await?;
      if !self.take_rerun() {
        guard.armed = false;
        return Ok(FlushOutcome::Completed(report));
      }
    }
  }

  /// Either consume a pending rerun request or mark the flush finished.
  fn take_rerun(&self) -> bool {
    let mut state = lock(&self.flush);
    if state.rerun {
      state.rerun = false;
      true
    } else {
      state.running = false;
      false
    }
  }

  async fn pass<F, Fut>(&self, send: &F) -> Result<FlushReport, StoreError>
  where
    F: Fn(RequestSpec) -> Fut,
    Fut: Future<Output = Result<Response, TransportError>>,
  {
    let snapshot = self.pending()?;
    if snapshot.is_empty() {
      self.events.emit(Event::QueueFlushed {
        flushed: 0,
        remaining: 0,
      });
      return Ok(FlushReport::default());
    }

    let mut delivered = 0;
    let mut removed = HashSet::new();
    for op in &snapshot {
      match send(op.request.clone()).await {
        Ok(response) => {
          tracing::debug!(
            id = %op.id,
            path = %op.request.path,
            status = response.status,
            "replayed queued mutation"
          );
          delivered += 1;
          removed.insert(op.id);
        }
        Err(TransportError::InvalidRequest(reason)) => {
          // Would fail the same way on every pass
          tracing::warn!(id = %op.id, path = %op.request.path, %reason, "discarding unbuildable mutation");
          removed.insert(op.id);
        }
        Err(e) => {
          tracing::warn!(id = %op.id, path = %op.request.path, error = %e, "replay failed, keeping queued");
        }
      }
    }

    // Re-read so operations enqueued during the pass are kept
    let remaining = {
      let _guard = lock(&self.list);
      let mut ops = self.load()?;
      ops.retain(|op| !removed.contains(&op.id));
      self.save(&ops)?;
      ops.len()
    };

    let report = FlushReport {
      flushed: delivered,
      remaining,
    };
    tracing::info!(flushed = report.flushed, remaining = report.remaining, "flush pass complete");
    self.events.emit(Event::QueueFlushed {
      flushed: report.flushed,
      remaining: report.remaining,
    });
    Ok(report)
  }
}
