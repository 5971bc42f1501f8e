//! Mock transport for testing.
//!
//! Allows scripting responses per route, toggling connectivity and capturing
//! sent requests for verification.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Method, RequestSpec, Response, Transport, TransportError};

type Route = (Method, String);

#[derive(Debug, Default)]
struct MockTransportInner {
  offline: bool,
  sticky: HashMap<Route, Response>,
  once: HashMap<Route, VecDeque<Result<Response, TransportError>>>,
  delays: HashMap<String, Duration>,
  sent: Vec<RequestSpec>,
  assets: HashMap<String, Vec<u8>>,
  downloads: Vec<String>,
}

/// Scriptable in-process transport. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
  inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Toggle whether requests reach the "server".
  pub fn set_online(&self, online: bool) {
    self.inner.lock().unwrap().offline = !online;
  }

  /// Answer every request to this route with `response`.
  pub fn respond(&self, method: Method, path: &str, response: Response) {
    let mut inner = self.inner.lock().unwrap();
    inner.sticky.insert((method, path.to_string()), response);
  }

  /// Answer the next request to this route with `response`.
  pub fn respond_once(&self, method: Method, path: &str, response: Response) {
    self.push_once(method, path, Ok(response));
  }

  /// Fail the next request to this route without a response.
  pub fn fail_once(&self, method: Method, path: &str, error: TransportError) {
    self.push_once(method, path, Err(error));
  }

  fn push_once(&self, method: Method, path: &str, result: Result<Response, TransportError>) {
    let mut inner = self.inner.lock().unwrap();
    inner
      .once
      .entry((method, path.to_string()))
      .or_default()
      .push_back(result);
  }

  /// Hold requests to `path` (or downloads of that URL) for `delay`.
  pub fn delay(&self, path: &str, delay: Duration) {
    let mut inner = self.inner.lock().unwrap();
    inner.delays.insert(path.to_string(), delay);
  }

  /// Serve `bytes` for downloads of `url`.
  pub fn serve_asset(&self, url: &str, bytes: &[u8]) {
    let mut inner = self.inner.lock().unwrap();
    inner.assets.insert(url.to_string(), bytes.to_vec());
  }

  /// Every request that was attempted, in order.
  pub fn sent(&self) -> Vec<RequestSpec> {
    self.inner.lock().unwrap().sent.clone()
  }

  /// Requests attempted against `path`.
  pub fn sent_to(&self, path: &str) -> Vec<RequestSpec> {
    self
      .sent()
      .into_iter()
      .filter(|r| r.path == path)
      .collect()
  }

  /// URLs whose download was answered with bytes.
  pub fn downloads(&self) -> Vec<String> {
    self.inner.lock().unwrap().downloads.clone()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: &RequestSpec) -> Result<Response, TransportError> {
    let (delay, result) = {
      let mut inner = self.inner.lock().unwrap();
      inner.sent.push(request.clone());

      let route = (request.method, request.path.clone());
      let delay = inner.delays.get(&request.path).copied();
      let result = if inner.offline {
        Err(TransportError::Unreachable("network is down".to_string()))
      } else if let Some(next) = inner.once.get_mut(&route).and_then(|q| q.pop_front()) {
        next
      } else if let Some(response) = inner.sticky.get(&route) {
        Ok(response.clone())
      } else {
        Ok(Response::new(200, Value::Null))
      };
      (delay, result)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    result
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
    let (delay, result) = {
      let mut inner = self.inner.lock().unwrap();
      let delay = inner.delays.get(url).copied();
      let result = if inner.offline {
        Err(TransportError::Unreachable("network is down".to_string()))
      } else if let Some(bytes) = inner.assets.get(url).cloned() {
        inner.downloads.push(url.to_string());
        Ok(bytes)
      } else {
        Err(TransportError::Unreachable(format!("no asset at {}", url)))
      };
      (delay, result)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    result
  }

}
