use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that relative manifest paths are resolved against
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Assets fetched into a new cache generation at install time, in order
  #[serde(default)]
  pub manifest: Vec<String>,
  pub submission: SubmissionConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// SQLite database path (defaults to $XDG_DATA_HOME/scan-offline/offline.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files (logging to file is off when unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_cache_name")]
  pub name: String,
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Requests whose path contains this segment are never cached
  #[serde(default = "default_api_segment")]
  pub api_segment: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      version: default_cache_version(),
      api_segment: default_api_segment(),
    }
  }
}

impl CacheConfig {
  /// Identifier of the cache generation this build serves, e.g. "card-scanner-v1".
  pub fn generation(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

fn default_cache_name() -> String {
  "card-scanner".to_string()
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_api_segment() -> String {
  "/api/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
  /// Endpoint scan results are posted to
  pub url: Url,
  /// Token identifier sent alongside the access token
  pub token_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Background sync tag that triggers a queue drain
  #[serde(default = "default_sync_tag")]
  pub tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
    }
  }
}

fn default_sync_tag() -> String {
  "scan-submissions".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// URL probed to detect connectivity (defaults to the origin)
  pub probe_url: Option<Url>,
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
  #[serde(default = "default_probe_timeout")]
  pub timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      interval_secs: default_probe_interval(),
      timeout_secs: default_probe_timeout(),
    }
  }
}

impl ConnectivityConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs.max(1))
  }
}

fn default_probe_interval() -> u64 {
  15
}

fn default_probe_timeout() -> u64 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./scan-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/scan-offline/config.yaml
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
        "No configuration file found. Create one at ~/.config/scan-offline/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("scan-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("scan-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.cache.api_segment.is_empty() {
      return Err(eyre!("cache.api_segment must not be empty"));
    }

    Ok(config)
  }

  /// Resolve the manifest entries against the origin.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self
      .manifest
      .iter()
      .map(|entry| {
        self
          .origin
          .join(entry)
          .map_err(|e| eyre!("Invalid manifest entry '{}': {}", entry, e))
      })
      .collect()
  }

  /// URL used by the connectivity probe.
  pub fn probe_url(&self) -> Url {
    self
      .connectivity
      .probe_url
      .clone()
      .unwrap_or_else(|| self.origin.clone())
  }

  /// Get the submission access token from the environment.
  ///
  /// Checks SCAN_OFFLINE_ACCESS_TOKEN.
  pub fn get_access_token() -> Result<String> {
    std::env::var("SCAN_OFFLINE_ACCESS_TOKEN").map_err(|_| {
      eyre!("Access token not found. Set the SCAN_OFFLINE_ACCESS_TOKEN environment variable.")
    })
  }
}
