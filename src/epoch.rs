//! Cache epoch guard.
//!
//! Bumping `CURRENT_EPOCH` in a release makes every client throw away its
//! local cache on the next start. Use it for changes an additive schema
//! migration cannot express.

use color_eyre::Result;

use crate::cache::StoreHandle;
use crate::settings::SettingsFile;

pub const CURRENT_EPOCH: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochCheck {
  /// Marker matched, nothing was touched
  Current,
  /// Store was destroyed and the marker rewritten
  Reset { previous: Option<u32> },
}

/// Compare the persisted marker with `current` and reset the store on mismatch.
///
/// Must run before any controller opens the store.
pub fn ensure(settings: &SettingsFile, store: &StoreHandle, current: u32) -> Result<EpochCheck> {
  let mut values = settings.load()?;
  if values.cache_epoch == Some(current) {
    tracing::debug!(epoch = current, "cache epoch is current");
    return Ok(EpochCheck::Current);
  }

  let previous = values.cache_epoch;
  tracing::info!(?previous, current, "cache epoch changed, discarding local cache");

  store.destroy()?;
  values.cache_epoch = Some(current);
  settings.save(&values)?;

  Ok(EpochCheck::Reset { previous })
}

/// Forget the marker so the next start resets the store.
pub fn clear(settings: &SettingsFile) -> Result<()> {
  let mut values = settings.load()?;
  values.cache_epoch = None;
  settings.save(&values)
}
