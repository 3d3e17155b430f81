use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST backend, e.g. https://api.example.com/v1
  pub base_url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
  15_000
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Time after which cached data is stale and eligible for refresh
  pub stale_time_ms: u64,
  /// Time an unobserved entry is kept before eviction
  pub gc_time_ms: u64,
  /// Refresh observed stale entries when connectivity comes back
  pub refetch_on_reconnect: bool,
  /// Refresh observed stale entries when the app returns to the foreground
  pub refetch_on_focus: bool,
  /// Persisted entries older than this are dropped on hydration
  pub persist_max_age_ms: u64,
  /// Persisted caches written under a different buster are discarded
  pub buster: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: 5 * 60 * 1000,
      gc_time_ms: 10 * 60 * 1000,
      refetch_on_reconnect: true,
      refetch_on_focus: false,
      persist_max_age_ms: 24 * 60 * 60 * 1000,
      buster: env!("CARGO_PKG_VERSION").to_string(),
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_millis(self.stale_time_ms)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::from_millis(self.gc_time_ms)
  }

  pub fn persist_max_age(&self) -> Duration {
    Duration::from_millis(self.persist_max_age_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
  pub query_max_retries: u32,
  /// Capped at `query_max_retries`: writes never retry more than reads
  pub mutation_max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      query_max_retries: 3,
      mutation_max_retries: 1,
      base_delay_ms: 1_000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Override for the durable store location
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Override for the log directory
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Defaults for everything but the backend address.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        timeout_ms: default_timeout_ms(),
      },
      cache: CacheConfig::default(),
      retry: RetryConfig::default(),
      storage: StorageConfig::default(),
      logging: LoggingConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 with at least `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", config.api.base_url, e))?;
    Ok(config)
  }

  /// Get the API token from the environment, if set.
  ///
  /// Used as a fallback when no token has been stored with `login`.
  pub fn env_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Directory holding the durable store and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync"))
  }

  /// Location of the durable key-value store.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("storage.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.logging.dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }
}
