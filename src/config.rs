use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{RegionRole, RegionSpec};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative URLs (fallback, precache, prefetch) resolve against
  pub origin: String,
  /// Suffix of every region identity; bump it to retire old regions
  pub version: String,
  /// Where the cache and queue databases live
  pub data_dir: Option<PathBuf>,
  /// Document served when a navigation cannot reach the network
  pub offline_fallback: String,
  /// Assets stored in the precache region at install
  pub precache: Vec<String>,
  pub api_prefix: String,
  /// Scheme prefixes that are never intercepted
  pub ignored_schemes: Vec<String>,
  pub regions: RegionsConfig,
  pub replay: ReplayConfig,
  pub periodic_sync: PeriodicSyncConfig,
  pub log: LogConfig,
}

/// Maximum entry counts per region. Absent means unbounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegionsConfig {
  pub precache: Option<usize>,
  pub runtime: Option<usize>,
  pub media: Option<usize>,
  pub images: Option<usize>,
  pub api: Option<usize>,
}

impl Default for RegionsConfig {
  fn default() -> Self {
    Self {
      precache: None,
      runtime: None,
      media: Some(30),
      images: Some(100),
      api: Some(50),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
  /// Tag of the reconnect signal that drains the write queue
  pub sync_tag: String,
  /// Self-deliver the reconnect signal at this interval while writes are
  /// pending. Disabled when absent.
  pub retry_interval_secs: Option<u64>,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      sync_tag: "post-queue-sync".to_string(),
      retry_interval_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodicSyncConfig {
  pub tag: String,
  /// Refreshed into the API region on each periodic sync
  pub url: String,
}

impl Default for PeriodicSyncConfig {
  fn default() -> Self {
    Self {
      tag: "content-sync".to_string(),
      url: "/api/latest".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Log to this file instead of stderr
  pub file: Option<PathBuf>,
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      file: None,
      level: "info".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost/".to_string(),
      version: "v6".to_string(),
      data_dir: None,
      offline_fallback: "/offline.html".to_string(),
      precache: Vec::new(),
      api_prefix: "/api/".to_string(),
      ignored_schemes: vec!["chrome".to_string(), "devtools".to_string()],
      regions: RegionsConfig::default(),
      replay: ReplayConfig::default(),
      periodic_sync: PeriodicSyncConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
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
    if config.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    config.origin_url()?;
    Ok(config)
  }

  /// Directory for the databases. Defaults to the platform data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache"))
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(url)
      .map_err(|e| eyre!("Invalid url '{}': {}", url, e))
  }

  /// The configured region set, one spec per role.
  pub fn region_specs(&self) -> Vec<RegionSpec> {
    RegionRole::ALL
      .iter()
      .map(|&role| {
        let capacity = match role {
          RegionRole::Precache => self.regions.precache,
          RegionRole::Runtime => self.regions.runtime,
          RegionRole::Media => self.regions.media,
          RegionRole::Images => self.regions.images,
          RegionRole::Api => self.regions.api,
        };
        RegionSpec::versioned(role, &self.version, capacity)
      })
      .collect()
  }

  /// Log filter from OFFCACHE_LOG, falling back to the configured level.
  pub fn log_filter(&self) -> String {
    std::env::var("OFFCACHE_LOG").unwrap_or_else(|_| self.log.level.clone())
  }
}
