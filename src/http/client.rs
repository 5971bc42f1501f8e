use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{Method, RequestSpec, Response, Transport, TransportError};

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  /// Create a transport for `base_url` with a per-request timeout.
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
    // A trailing slash makes `join` append instead of replacing the last segment
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url = Url::parse(&normalized)
      .map_err(|e| TransportError::InvalidRequest(format!("bad base url {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| TransportError::InvalidRequest(format!("failed to build client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  fn resolve(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| TransportError::InvalidRequest(format!("bad path {}: {}", path, e)))
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Options => reqwest::Method::OPTIONS,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn classify(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else if err.is_builder() {
    TransportError::InvalidRequest(err.to_string())
  } else {
    TransportError::Unreachable(err.to_string())
  }
}

/// Decode a response body: JSON when it parses, text otherwise.
fn decode_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &RequestSpec) -> Result<Response, TransportError> {
    let mut url = self.resolve(&request.path)?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(request.query.iter());
    }

    let mut builder = self.client.request(to_reqwest_method(request.method), url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      let payload = serde_json::to_vec(body)
        .map_err(|e| TransportError::InvalidRequest(format!("bad body: {}", e)))?;
      builder = builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(payload);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(classify)?;

    Ok(Response::new(status, decode_body(&bytes)))
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
    let target = match Url::parse(url) {
      Ok(absolute) => absolute,
      Err(_) => self.resolve(url)?,
    };

    let response = self.client.get(target).send().await.map_err(classify)?;
    if !response.status().is_success() {
      return Err(TransportError::Unreachable(format!(
        "download of {} returned {}",
        url,
        response.status()
      )));
    }
    let bytes = response.bytes().await.map_err(classify)?;
    Ok(bytes.to_vec())
  }
}
