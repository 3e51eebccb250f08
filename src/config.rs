use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sync::PruneScope;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base url of the document API, e.g. https://invoices.example.com/api
  pub url: String,
  /// Request timeout. No timeout when unset.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Directory holding cache.db, settings.json and the log file
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// How reconciliation prunes rows for filtered queries
  pub prune_scope: PruneScope,
  /// Collapse overlapping loads of the same query into one fetch
  pub coalesce: bool,
  /// Seconds between connectivity probes in watch mode
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      prune_scope: PruneScope::default(),
      coalesce: true,
      probe_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./docsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/docsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/docsync/config.yaml \
         or pass --api-url."
      )),
    }
  }

  /// Configuration with defaults for everything but the API url.
  pub fn with_api_url(url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        url: url.into(),
        timeout_secs: None,
      },
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("docsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("docsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Directory for the cache database, settings and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.cache.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("docsync"))
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// The API is called without authentication when DOCSYNC_API_TOKEN is unset.
  pub fn get_api_token() -> Option<String> {
    std::env::var("DOCSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
