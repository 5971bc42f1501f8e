//! Request model and transport abstraction for the remote resource server.
//!
//! The dispatcher never talks to reqwest directly; it goes through
//! [`Transport`] so tests can script responses and toggle connectivity.

mod client;
#[cfg(test)]
pub mod mock;

pub use client::HttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether the method is free of side effects and safe to serve from cache.
  pub fn is_read(self) -> bool {
    matches!(self, Method::Get | Method::Head | Method::Options)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "OPTIONS" => Ok(Method::Options),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// Everything needed to issue (or later replay) one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
  pub method: Method,
  /// Path relative to the configured base endpoint, e.g. `/routes`
  pub path: String,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Cache scope for reads; scope-less reads are never cached
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scope: Option<String>,
}

impl RequestSpec {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: BTreeMap::new(),
      body: None,
      headers: BTreeMap::new(),
      scope: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, path).with_body(body)
  }

  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.insert(key.into(), value.into());
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn scoped(mut self, scope: impl Into<String>) -> Self {
    self.scope = Some(scope.into());
    self
  }

  /// Look up a header by name, ignoring ASCII case.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response obtained from the server, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub body: Value,
}

impl Response {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failures where no response was obtained at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  /// The server could not be reached.
  #[error("server unreachable: {0}")]
  Unreachable(String),

  /// No response within the allotted time.
  #[error("request timed out")]
  Timeout,

  /// The request could not be built (bad path, bad header).
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The caller aborted before a response arrived.
  #[error("request cancelled: {0}")]
  Cancelled(String),
}

/// Sends requests to the remote resource server.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Send one request. Any HTTP status is a `Response`; only a missing
  /// response is an error.
  async fn send(&self, request: &RequestSpec) -> Result<Response, TransportError>;

  /// Fetch raw bytes from an absolute or base-relative URL.
  async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}
