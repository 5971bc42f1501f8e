use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::RequestSpec;

/// One cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub scope: String,
  /// Request signature, see [`signature`]
  pub key: String,
  pub value: Value,
  pub updated_at: DateTime<Utc>,
}

/// Canonical cache key for a request: `path|{sorted query as JSON}`.
///
/// The query map is ordered, so the same parameters in any insertion order
/// produce the same signature, e.g. `/routes|{}` or `/stops|{"route":"R1"}`.
pub fn signature(request: &RequestSpec) -> String {
  let query = serde_json::to_string(&request.query).unwrap_or_else(|_| "{}".to_string());
  format!("{}|{}", request.path, query)
}
