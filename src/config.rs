use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_IGNORED_PARAMS;
use crate::outbox::{DEFAULT_CAPACITY, DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_MAX_ATTEMPTS};
use crate::store::SqliteStore;

const DEFAULT_TOKEN_ENV: &str = "OFFSYNC_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub outbox: OutboxConfig,
  pub sync: SyncConfig,
  /// SQLite file (defaults to $XDG_DATA_HOME/offsync/offsync.db)
  pub database: Option<PathBuf>,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: Option<String>,
  /// Upper bound on a single live call
  pub timeout_secs: u64,
  /// Environment variable holding the bearer token
  pub token_env: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: 60,
      token_env: DEFAULT_TOKEN_ENV.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub freshness_hours: i64,
  /// Query parameters left out of cache keys
  pub ignored_query_params: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      freshness_hours: 24,
      ignored_query_params: DEFAULT_IGNORED_PARAMS.iter().map(|p| p.to_string()).collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  pub max_attempts: u32,
  pub capacity: usize,
  pub dead_letter_capacity: usize,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      capacity: DEFAULT_CAPACITY,
      dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Drop the cached read of a target after a successful write to it
  pub invalidate_on_write: bool,
  pub probe_interval_secs: u64,
  /// Retry a drain that stopped on a server error after this long
  pub retry_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      invalidate_on_write: true,
      probe_interval_secs: 10,
      retry_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter used when RUST_LOG is unset
  pub level: String,
  /// Also write a daily-rotated log file
  pub file: bool,
  /// Log directory (defaults next to the database)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "offsync=info".to_string(),
      file: true,
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// With no file anywhere, defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be greater than zero"));
    }
    if self.cache.freshness_hours <= 0 {
      return Err(eyre!("cache.freshness_hours must be greater than zero"));
    }
    if self.outbox.max_attempts == 0 {
      return Err(eyre!("outbox.max_attempts must be greater than zero"));
    }
    if self.outbox.capacity == 0 {
      return Err(eyre!("outbox.capacity must be greater than zero"));
    }
    Ok(())
  }

  /// The backend base URL; required for anything that talks to the network.
  pub fn base_url(&self) -> Result<&str> {
    self.api.base_url.as_deref().ok_or_else(|| {
      eyre!("No API base URL configured. Set api.base_url in offsync.yaml or pass --base-url.")
    })
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn freshness_window(&self) -> chrono::Duration {
    chrono::Duration::hours(self.cache.freshness_hours)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.sync.retry_interval_secs.max(1))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(expand_home(path)),
      None => SqliteStore::default_path(),
    }
  }

  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.logging.directory {
      return Ok(expand_home(dir));
    }
    let db = self.database_path()?;
    Ok(
      db.parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs")),
    )
  }
}

fn expand_home(path: &Path) -> PathBuf {
  match (path.strip_prefix("~"), dirs::home_dir()) {
    (Ok(rest), Some(home)) => home.join(rest),
    _ => path.to_path_buf(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_gives_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.api.timeout_secs, 60);
    assert_eq!(config.cache.freshness_hours, 24);
    assert_eq!(config.outbox.max_attempts, 5);
    assert_eq!(config.outbox.capacity, 100);
    assert!(config.sync.invalidate_on_write);
    assert_eq!(config.retry_interval(), Duration::from_secs(30));
    assert!(config.base_url().is_err());
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::from_yaml(
      r#"
api:
  base_url: "http://192.168.0.106:8001/api/v1"
  timeout_secs: 15
outbox:
  capacity: 10
database: /tmp/offsync-test.db
"#,
    )
    .unwrap();

    assert_eq!(config.base_url().unwrap(), "http://192.168.0.106:8001/api/v1");
    assert_eq!(config.timeout(), Duration::from_secs(15));
    assert_eq!(config.outbox.capacity, 10);
    assert_eq!(config.outbox.dead_letter_capacity, 50);
    assert_eq!(config.api.token_env, "OFFSYNC_TOKEN");
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/offsync-test.db")
    );
    assert_eq!(config.log_directory().unwrap(), PathBuf::from("/tmp/logs"));
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    assert!(Config::from_yaml("outbox:\n  max_attempts: 0\n").is_err());
    assert!(Config::from_yaml("cache:\n  freshness_hours: -1\n").is_err());
    assert!(Config::from_yaml("api:\n  timeout_secs: nope\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/offsync.yaml"))).is_err());
  }
}
