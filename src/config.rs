use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, read once at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub branding: BrandingConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Tenant (school) identifier used for cache and branding scopes
  pub scope: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// Lightweight endpoint used for liveness probes
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
  #[serde(default = "default_probe_timeout")]
  pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// How often to retry queued mutations while connected
  #[serde(default = "default_flush_interval")]
  pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
  /// Window in which repeated auth rejections raise one re-auth signal
  #[serde(default = "default_reauth_debounce")]
  pub reauth_debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandingConfig {
  #[serde(default = "default_branding_path")]
  pub path: String,
  /// Asset kinds to track (case-insensitive)
  #[serde(
    default = "default_branding_assets",
    deserialize_with = "deserialize_lowercase_set"
  )]
  pub assets: BTreeSet<String>,
  pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  pub path: Option<PathBuf>,
}

fn default_request_timeout() -> u64 {
  30
}

fn default_probe_path() -> String {
  "/health".to_string()
}

fn default_probe_interval() -> u64 {
  8
}

fn default_probe_timeout() -> u64 {
  5
}

fn default_flush_interval() -> u64 {
  30
}

fn default_reauth_debounce() -> u64 {
  2000
}

fn default_branding_path() -> String {
  "/branding".to_string()
}

fn default_branding_assets() -> BTreeSet<String> {
  BTreeSet::from(["logo".to_string()])
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: default_probe_path(),
      probe_interval_secs: default_probe_interval(),
      probe_timeout_secs: default_probe_timeout(),
    }
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      flush_interval_secs: default_flush_interval(),
    }
  }
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      reauth_debounce_ms: default_reauth_debounce(),
    }
  }
}

impl Default for BrandingConfig {
  fn default() -> Self {
    Self {
      path: default_branding_path(),
      assets: default_branding_assets(),
      directory: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|dir| dir.join("fleetsync"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fleetsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fleetsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate configuration from YAML text.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("api.base_url {} is not a valid URL: {}", self.api.base_url, e))?;
    if self.api.scope.trim().is_empty() {
      return Err(eyre!("api.scope must not be empty"));
    }
    if self.connectivity.probe_interval_secs == 0 || self.queue.flush_interval_secs == 0 {
      return Err(eyre!("polling intervals must be at least one second"));
    }
    Ok(())
  }

  /// Get a seed token from the environment, if set.
  ///
  /// Checks FLEETSYNC_TOKEN.
  pub fn get_token() -> Option<String> {
    std::env::var("FLEETSYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.request_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_timeout_secs)
  }

  pub fn flush_interval(&self) -> Duration {
    Duration::from_secs(self.queue.flush_interval_secs)
  }

  pub fn reauth_debounce(&self) -> Duration {
    Duration::from_millis(self.auth.reauth_debounce_ms)
  }

  /// Durable store location: configured path or the data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("store.db")),
    }
  }

  /// Directory holding downloaded branding assets.
  pub fn branding_dir(&self) -> Result<PathBuf> {
    match &self.branding.directory {
      Some(dir) => Ok(dir.clone()),
      None => Ok(data_dir()?.join("branding")),
    }
  }

  /// Directory for rolling log files.
  pub fn log_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
  }
}
