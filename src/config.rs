use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::polling::ActivityPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub polling: PollingConfig,
  #[serde(default)]
  pub pagination: PaginationConfig,
  #[serde(default)]
  pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: DEFAULT_API_URL.to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false nothing is persisted; the cache lives in memory only.
  pub enabled: bool,
  /// SQLite file (defaults to the platform data dir). `~/` is expanded.
  pub path: Option<PathBuf>,
  pub namespace: String,
  pub ttl_secs: u64,
  pub max_age_factor: i32,
  /// Block reads on a refresh once the cached value is older than this.
  pub blocking_staleness_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      namespace: "opsdeck".to_string(),
      ttl_secs: 30,
      max_age_factor: 5,
      blocking_staleness_secs: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.ttl_secs as i64)
  }

  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      namespace: self.namespace.clone(),
      max_age_factor: self.max_age_factor,
      blocking_staleness: self
        .blocking_staleness_secs
        .map(|secs| chrono::Duration::seconds(secs as i64)),
      ..CacheOptions::default()
    }
  }

  pub fn resolved_path(&self) -> Option<PathBuf> {
    self.path.as_deref().map(expand_home)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  /// Job polling interval while any job is running
  pub active_ms: u64,
  /// Job polling interval when everything is terminal
  pub idle_ms: u64,
  pub dashboard_secs: u64,
  pub logs_secs: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      active_ms: 3000,
      idle_ms: 15000,
      dashboard_secs: 30,
      logs_secs: 10,
    }
  }
}

impl PollingConfig {
  pub fn jobs_policy(&self) -> ActivityPolicy {
    ActivityPolicy {
      active: Duration::from_millis(self.active_ms),
      idle: Duration::from_millis(self.idle_ms),
    }
  }

  pub fn dashboard_interval(&self) -> Duration {
    Duration::from_secs(self.dashboard_secs)
  }

  pub fn logs_interval(&self) -> Duration {
    Duration::from_secs(self.logs_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
  pub page_size: usize,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self { page_size: 20 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Newest points kept in the cost trend
  pub max_points: usize,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self { max_points: 30 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./opsdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/opsdeck/config.yaml
  ///
  /// With no file anywhere the defaults are used. `OPSDECK_API_URL`
  /// overrides `api.url` either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("OPSDECK_API_URL") {
      if !url.is_empty() {
        config.api.url = url;
      }
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("opsdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("opsdeck").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null rather than an empty mapping
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.pagination.page_size == 0 {
      return Err(eyre!("pagination.page_size must be at least 1"));
    }
    if self.cache.max_age_factor < 1 {
      return Err(eyre!("cache.max_age_factor must be at least 1"));
    }
    if self.polling.active_ms == 0 || self.polling.idle_ms == 0 {
      return Err(eyre!("polling intervals must be positive"));
    }
    Ok(())
  }

  /// Get the console API key from the environment.
  ///
  /// Checks OPSDECK_API_KEY. Requests go out unauthenticated without it.
  pub fn get_api_key() -> Option<String> {
    std::env::var("OPSDECK_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }
}

fn expand_home(path: &Path) -> PathBuf {
  match path.strip_prefix("~") {
    Ok(rest) => dirs::home_dir()
      .map(|home| home.join(rest))
      .unwrap_or_else(|| path.to_path_buf()),
    Err(_) => path.to_path_buf(),
  }
}
