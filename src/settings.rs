//! Small key-value settings persisted next to the cache, outside of it.
//!
//! Anything stored here survives a cache reset.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
  /// Epoch the local cache was built under
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_epoch: Option<u32>,
}

/// Settings file on disk.
#[derive(Debug, Clone)]
pub struct SettingsFile {
  path: PathBuf,
}

impl SettingsFile {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Read settings. A missing file yields defaults.
  pub fn load(&self) -> Result<Settings> {
    let contents = match std::fs::read_to_string(&self.path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
      Err(e) => {
        return Err(eyre!(
          "Failed to read settings {}: {}",
          self.path.display(),
          e
        ))
      }
    };

    match serde_json::from_str(&contents) {
      Ok(settings) => Ok(settings),
      Err(e) => {
        // Unreadable settings only cost us a cache reset
        tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt settings file");
        Ok(Settings::default())
      }
    }
  }

  /// Write settings via a temp file and rename.
  pub fn save(&self, settings: &Settings) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
    }

    let json = serde_json::to_vec_pretty(settings)
      .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

    let mut tmp = self.path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json)
      .map_err(|e| eyre!("Failed to write settings {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace settings {}: {}", self.path.display(), e))?;
    Ok(())
  }
}
