//! Versioned branding assets (school logo, splash image).
//!
//! Per scope the synchronizer moves through:
//!
//! ```text
//! Unknown → hydrate (local only) → HydratedStale → one version check
//!   ├─ marker unchanged → Current (no bytes transferred)
//!   ├─ marker changed   → Updated (re-download, replace files) → Current
//!   └─ check failed     → HydratedStale (keep serving what we have)
//! ```
//!
//! The server's branding document looks like
//! `{"version": "7", "updatedAt": "...", "assets": {"logo": "https://..."}}`.
//! The version marker is `version` when present, else `updatedAt`, else the
//! document is treated as always changed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::dispatch::{Dispatcher, ReplySource};
use crate::events::{Event, EventBus};
use crate::http::{RequestSpec, TransportError};
use crate::store::{self, KeyValueStore, StoreError};

#[derive(Debug, Error)]
pub enum BrandingError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to write asset: {0}")]
  Io(#[from] std::io::Error),
}

/// Value deciding whether remote assets changed since the last fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VersionMarker {
  Version(String),
  Timestamp(String),
  /// No marker on the server; every check counts as a change
  Unversioned,
}

impl VersionMarker {
  pub fn from_document(document: &Value) -> Self {
    let field = |name: &str| match document.get(name) {
      Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
      Some(Value::Number(n)) => Some(n.to_string()),
      _ => None,
    };

    if let Some(version) = field("version") {
      VersionMarker::Version(version)
    } else if let Some(timestamp) = field("updatedAt") {
      VersionMarker::Timestamp(timestamp)
    } else {
      VersionMarker::Unversioned
    }
  }

  /// Whether an asset stored under `self` is still current for `remote`.
  pub fn is_current_for(&self, remote: &VersionMarker) -> bool {
    *remote != VersionMarker::Unversioned && self == remote
  }
}

/// A downloaded asset and the marker it was fetched under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandingAsset {
  pub scope: String,
  pub kind: String,
  pub marker: VersionMarker,
  pub local_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
  #[default]
  Unknown,
  HydratedStale,
  Updated,
  Current,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Markers matched; nothing was downloaded
  Current,
  /// These assets were re-downloaded
  Updated(Vec<BrandingAsset>),
  /// The version check failed; the hydrated state is kept
  Unreachable,
}

impl SyncOutcome {
  pub fn updated_count(&self) -> usize {
    match self {
      SyncOutcome::Updated(assets) => assets.len(),
      _ => 0,
    }
  }
}

/// Result of activating a scope: what was on disk, then what the check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
  pub hydrated: Vec<BrandingAsset>,
  pub outcome: SyncOutcome,
}

#[derive(Debug, Default)]
struct ScopeView {
  state: AssetState,
  assets: Vec<BrandingAsset>,
}

pub struct AssetSynchronizer {
  dispatcher: Arc<Dispatcher>,
  store: Arc<dyn KeyValueStore>,
  events: EventBus,
  document_path: String,
  kinds: Vec<String>,
  directory: PathBuf,
  views: Mutex<HashMap<String, ScopeView>>,
}

impl AssetSynchronizer {
  pub fn new(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    document_path: &str,
    kinds: Vec<String>,
    directory: PathBuf,
  ) -> Self {
    Self {
      dispatcher,
      store,
      events,
      document_path: document_path.to_string(),
      kinds,
      directory,
      views: Mutex::new(HashMap::new()),
    }
  }

  fn metadata_key(scope: &str, kind: &str) -> String {
    format!("branding:{}:{}", store::key_segment(scope), kind)
  }

  fn update_view(&self, scope: &str, state: AssetState, assets: Vec<BrandingAsset>) {
    let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
    let view = views.entry(scope.to_string()).or_default();
    view.state = state;
    view.assets = assets;
  }

  fn set_state(&self, scope: &str, state: AssetState) {
    let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
    views.entry(scope.to_string()).or_default().state = state;
  }

  pub fn state(&self, scope: &str) -> AssetState {
    let views = self.views.lock().unwrap_or_else(|e| e.into_inner());
    views.get(scope).map(|v| v.state).unwrap_or_default()
  }

  /// Assets currently presented for `scope`.
  pub fn assets(&self, scope: &str) -> Vec<BrandingAsset> {
    let views = self.views.lock().unwrap_or_else(|e| e.into_inner());
    views
      .get(scope)
      .map(|v| v.assets.clone())
      .unwrap_or_default()
  }

  fn load_persisted(&self, scope: &str) -> Result<Vec<BrandingAsset>, StoreError> {
    let mut assets = Vec::new();
    for kind in &self.kinds {
      let asset: Option<BrandingAsset> =
        store::get_json(self.store.as_ref(), &Self::metadata_key(scope, kind))?;
      assets.extend(asset);
    }
    Ok(assets)
  }

  /// Present locally persisted assets. Never touches the network.
  pub fn hydrate(&self, scope: &str) -> Result<Vec<BrandingAsset>, BrandingError> {
    let assets = self.load_persisted(scope)?;
    tracing::debug!(scope, count = assets.len(), "hydrated branding assets");
    self.update_view(scope, AssetState::HydratedStale, assets.clone());
    Ok(assets)
  }

  /// Hydrate, then run exactly one version check.
  pub async fn activate(&self, scope: &str) -> Result<Activation, BrandingError> {
    let hydrated = self.hydrate(scope)?;
    let outcome = self.check(scope).await?;
    Ok(Activation { hydrated, outcome })
  }

  /// Manual refresh: re-run the version check and announce the result.
  pub async fn refresh(&self, scope: &str) -> Result<SyncOutcome, BrandingError> {
    let outcome = self.check(scope).await?;
    self.events.emit(Event::BrandingRefreshed {
      scope: scope.to_string(),
      updated: outcome.updated_count(),
    });
    Ok(outcome)
  }

  /// One remote version check for `scope`.
  pub async fn check(&self, scope: &str) -> Result<SyncOutcome, BrandingError> {
    let request = RequestSpec::get(self.document_path.clone())
      .with_query("scope", scope)
      .scoped(scope);

    let document = match self.dispatcher.dispatch(request).await {
      Ok(reply) if reply.source == ReplySource::Network => reply.data,
      Ok(_) => {
        tracing::debug!(scope, "branding check offline, keeping hydrated assets");
        return Ok(SyncOutcome::Unreachable);
      }
      Err(e) => {
        tracing::debug!(scope, error = %e, "branding check failed, keeping hydrated assets");
        return Ok(SyncOutcome::Unreachable);
      }
    };

    let marker = VersionMarker::from_document(&document);
    let mut updated = Vec::new();
    let mut stale = false;
    let mut aborted = false;

    for kind in &self.kinds {
      let key = Self::metadata_key(scope, kind);
      let previous: Option<BrandingAsset> = store::get_json(self.store.as_ref(), &key)?;
      if previous
        .as_ref()
        .is_some_and(|asset| asset.marker.is_current_for(&marker))
      {
        continue;
      }

      self.set_state(scope, AssetState::Updated);
      let Some(url) = document
        .get("assets")
        .and_then(|assets| assets.get(kind))
        .and_then(Value::as_str)
      else {
        tracing::warn!(scope, kind, "branding document has no url for asset");
        continue;
      };

      let bytes = match self.dispatcher.download(url).await {
        Ok(bytes) => bytes,
        Err(TransportError::Cancelled(reason)) => {
          tracing::info!(scope, kind, %reason, "asset download aborted");
          stale = true;
          aborted = true;
          break;
        }
        Err(e) => {
          tracing::warn!(scope, kind, url, error = %e, "asset download failed");
          stale = true;
          continue;
        }
      };

      let local_path = self.write_asset(scope, kind, url, &bytes).await?;
      let asset = BrandingAsset {
        scope: scope.to_string(),
        kind: kind.clone(),
        marker: marker.clone(),
        local_path,
      };
      store::set_json(self.store.as_ref(), &key, &asset)?;

      if let Some(old) = previous {
        if old.local_path != asset.local_path {
          if let Err(e) = tokio::fs::remove_file(&old.local_path).await {
            tracing::debug!(path = %old.local_path.display(), error = %e, "could not remove old asset");
          }
        }
      }
      updated.push(asset);
    }

    let assets = self.load_persisted(scope)?;
    let state = if stale {
      AssetState::HydratedStale
    } else {
      AssetState::Current
    };
    self.update_view(scope, state, assets);

    if aborted && updated.is_empty() {
      return Ok(SyncOutcome::Unreachable);
    }
    if updated.is_empty() {
      Ok(SyncOutcome::Current)
    } else {
      tracing::info!(scope, updated = updated.len(), ?marker, "branding assets updated");
      Ok(SyncOutcome::Updated(updated))
    }
  }

  /// Write bytes to a content-addressed file, replacing atomically.
  async fn write_asset(
    &self,
    scope: &str,
    kind: &str,
    url: &str,
    bytes: &[u8],
  ) -> Result<PathBuf, std::io::Error> {
    let dir = self.directory.join(store::key_segment(scope));
    tokio::fs::create_dir_all(&dir).await?;

    let digest = hex::encode(Sha256::digest(bytes));
    let name = format!("{}-{}.{}", kind, &digest[..16], extension(url));
    let path = dir.join(name);

    let partial = path.with_extension("part");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, &path).await?;
    Ok(path)
  }
}

/// File extension taken from the last URL path segment, `bin` when absent.
fn extension(url: &str) -> String {
  let path = url.split(['?', '#']).next().unwrap_or_default();
  let segment = path.rsplit('/').next().unwrap_or_default();
  Path::new(segment)
    .extension()
    .and_then(|ext| ext.to_str())
    .filter(|ext| !ext.is_empty() && ext.len() <= 5)
    .map(str::to_ascii_lowercase)
    .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::mock::MockTransport;
  use crate::http::{Method, Response, Transport};
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::time::Duration;

  const LOGO: &str = "https://cdn.example.com/s9/logo.png";
  const SPLASH: &str = "https://cdn.example.com/s9/splash.jpg?v=1";

  struct Fixture {
    transport: MockTransport,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    dir: tempfile::TempDir,
  }

  impl Fixture {
    fn new() -> Self {
      let transport = MockTransport::new();
      transport.serve_asset(LOGO, b"logo-v1");
      transport.serve_asset(SPLASH, b"splash-v1");
      Self {
        transport,
        store: Arc::new(MemoryStore::new()),
        events: EventBus::default(),
        dir: tempfile::tempdir().unwrap(),
      }
    }

    /// A fresh synchronizer over the same store, like an app relaunch.
    fn synchronizer(&self) -> AssetSynchronizer {
      let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());
      let dispatcher = Arc::new(Dispatcher::for_tests(
        transport,
        self.store.clone(),
        self.events.clone(),
      ));
      AssetSynchronizer::new(
        dispatcher,
        self.store.clone(),
        self.events.clone(),
        "/branding",
        vec!["logo".to_string(), "splash".to_string()],
        self.dir.path().to_path_buf(),
      )
    }

    fn publish(&self, document: Value) {
      self
        .transport
        .respond(Method::Get, "/branding", Response::new(200, document));
    }
  }

  fn document(version: &str) -> Value {
    json!({"version": version, "assets": {"logo": LOGO, "splash": SPLASH}})
  }

  #[test]
  fn test_marker_precedence() {
    assert_eq!(
      VersionMarker::from_document(&json!({"version": "3", "updatedAt": "t"})),
      VersionMarker::Version("3".to_string())
    );
    assert_eq!(
      VersionMarker::from_document(&json!({"version": 4})),
      VersionMarker::Version("4".to_string())
    );
    assert_eq!(
      VersionMarker::from_document(&json!({"updatedAt": "2024-05-01T00:00:00Z"})),
      VersionMarker::Timestamp("2024-05-01T00:00:00Z".to_string())
    );
    assert_eq!(
      VersionMarker::from_document(&json!({"assets": {}})),
      VersionMarker::Unversioned
    );
    assert!(!VersionMarker::Unversioned.is_current_for(&VersionMarker::Unversioned));
  }

  #[test]
  fn test_extension() {
    assert_eq!(extension(LOGO), "png");
    assert_eq!(extension(SPLASH), "jpg");
    assert_eq!(extension("/files/logo"), "bin");
  }

  #[tokio::test]
  async fn test_first_activation_downloads_everything() {
    let f = Fixture::new();
    f.publish(document("1"));
    let sync = f.synchronizer();

    let activation = sync.activate("school-9").await.unwrap();
    assert!(activation.hydrated.is_empty());
    assert_eq!(activation.outcome.updated_count(), 2);
    assert_eq!(sync.state("school-9"), AssetState::Current);

    let assets = sync.assets("school-9");
    assert_eq!(assets.len(), 2);
    for asset in &assets {
      assert_eq!(asset.marker, VersionMarker::Version("1".to_string()));
      assert!(asset.local_path.exists());
    }
    let logo = assets.iter().find(|a| a.kind == "logo").unwrap();
    assert_eq!(std::fs::read(&logo.local_path).unwrap(), b"logo-v1");
  }

  #[tokio::test]
  async fn test_equal_marker_skips_download() {
    let f = Fixture::new();
    f.publish(document("1"));
    f.synchronizer().activate("school-9").await.unwrap();
    assert_eq!(f.transport.downloads().len(), 2);

    let relaunched = f.synchronizer();
    let activation = relaunched.activate("school-9").await.unwrap();

    assert_eq!(activation.hydrated.len(), 2);
    assert_eq!(activation.outcome, SyncOutcome::Current);
    assert_eq!(f.transport.downloads().len(), 2);
    assert_eq!(f.transport.sent_to("/branding").len(), 2);
  }

  #[tokio::test]
  async fn test_changed_marker_redownloads_once_per_asset() {
    let f = Fixture::new();
    f.publish(document("1"));
    let sync = f.synchronizer();
    let first = sync.activate("school-9").await.unwrap();
    let old_paths: Vec<PathBuf> = match first.outcome {
      SyncOutcome::Updated(assets) => assets.into_iter().map(|a| a.local_path).collect(),
      other => panic!("unexpected: {:?}", other),
    };

    f.transport.serve_asset(LOGO, b"logo-v2");
    f.transport.serve_asset(SPLASH, b"splash-v2");
    f.publish(document("2"));
    let second = f.synchronizer().activate("school-9").await.unwrap();

    assert_eq!(second.outcome.updated_count(), 2);
    assert_eq!(f.transport.downloads().len(), 4);
    for path in old_paths {
      assert!(!path.exists());
    }

    let persisted: BrandingAsset = store::get_json(
      f.store.as_ref(),
      &AssetSynchronizer::metadata_key("school-9", "logo"),
    )
    .unwrap()
    .unwrap();
    assert_eq!(persisted.marker, VersionMarker::Version("2".to_string()));
    assert_eq!(std::fs::read(&persisted.local_path).unwrap(), b"logo-v2");
  }

  #[tokio::test]
  async fn test_offline_keeps_hydrated_state() {
    let f = Fixture::new();
    f.publish(document("1"));
    f.synchronizer().activate("school-9").await.unwrap();

    f.transport.set_online(false);
    let sync = f.synchronizer();
    let activation = sync.activate("school-9").await.unwrap();

    assert_eq!(activation.outcome, SyncOutcome::Unreachable);
    assert_eq!(activation.hydrated.len(), 2);
    assert_eq!(sync.state("school-9"), AssetState::HydratedStale);
    assert_eq!(sync.assets("school-9"), activation.hydrated);
  }

  #[tokio::test]
  async fn test_unversioned_document_always_downloads() {
    let f = Fixture::new();
    f.publish(json!({"assets": {"logo": LOGO, "splash": SPLASH}}));
    let sync = f.synchronizer();

    sync.activate("school-9").await.unwrap();
    let again = sync.check("school-9").await.unwrap();

    assert_eq!(again.updated_count(), 2);
    assert_eq!(f.transport.downloads().len(), 4);
    // Same bytes land on the same content-addressed path
    for asset in sync.assets("school-9") {
      assert!(asset.local_path.exists());
    }
  }

  #[tokio::test]
  async fn test_timestamp_marker_is_compared() {
    let f = Fixture::new();
    f.publish(json!({"updatedAt": "2024-05-01", "assets": {"logo": LOGO, "splash": SPLASH}}));
    let sync = f.synchronizer();
    sync.activate("school-9").await.unwrap();

    assert_eq!(sync.check("school-9").await.unwrap(), SyncOutcome::Current);

    f.publish(json!({"updatedAt": "2024-06-01", "assets": {"logo": LOGO, "splash": SPLASH}}));
    assert_eq!(sync.check("school-9").await.unwrap().updated_count(), 2);
  }

  #[tokio::test]
  async fn test_refresh_emits_event() {
    let f = Fixture::new();
    f.publish(document("1"));
    let mut rx = f.events.subscribe();
    let sync = f.synchronizer();

    sync.refresh("school-9").await.unwrap();

    let mut refreshed = None;
    while let Ok(event) = rx.try_recv() {
      if let Event::BrandingRefreshed { .. } = event {
        refreshed = Some(event);
      }
    }
    assert_eq!(
      refreshed,
      Some(Event::BrandingRefreshed {
        scope: "school-9".to_string(),
        updated: 2
      })
    );
  }

  #[tokio::test]
  async fn test_failed_download_keeps_previous_asset() {
    let f = Fixture::new();
    f.publish(document("1"));
    let sync = f.synchronizer();
    sync.activate("school-9").await.unwrap();

    f.publish(json!({"version": "2", "assets": {"logo": "https://cdn.example.com/missing.png", "splash": SPLASH}}));
    let outcome = sync.check("school-9").await.unwrap();

    assert_eq!(outcome.updated_count(), 1);
    assert_eq!(sync.state("school-9"), AssetState::HydratedStale);
    let logo = sync
      .assets("school-9")
      .into_iter()
      .find(|a| a.kind == "logo")
      .unwrap();
    assert_eq!(logo.marker, VersionMarker::Version("1".to_string()));
    assert!(logo.local_path.exists());
  }

  #[tokio::test]
  async fn test_cancelled_download_writes_nothing() {
    let f = Fixture::new();
    f.publish(document("1"));
    f.transport.delay(LOGO, Duration::from_secs(5));
    let sync = f.synchronizer();
    let group = sync.dispatcher.group().clone();

    let (outcome, cancelled) = tokio::join!(sync.check("school-9"), async {
      while f.transport.downloads().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      group.cancel_all("logout")
    });

    assert_eq!(cancelled, 1);
    assert_eq!(outcome.unwrap(), SyncOutcome::Unreachable);
    assert_eq!(sync.state("school-9"), AssetState::HydratedStale);
    assert!(sync.assets("school-9").is_empty());
    // Splash is never attempted once the check is aborted
    assert_eq!(f.transport.downloads(), vec![LOGO.to_string()]);
    let logo: Option<BrandingAsset> = store::get_json(
      f.store.as_ref(),
      &AssetSynchronizer::metadata_key("school-9", "logo"),
    )
    .unwrap();
    assert!(logo.is_none());
    assert_eq!(std::fs::read_dir(f.dir.path()).unwrap().count(), 0);
  }
}
