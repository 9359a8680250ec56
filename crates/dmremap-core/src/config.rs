//! Configuration for a remap target and its persistence layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RemapError, RemapResult};
use crate::layout::METADATA_SECTORS;
use crate::sector::SectorRange;

/// Shortest allowed auto-save interval.
pub const MIN_INTERVAL_MS: u64 = 1_000;
/// Longest allowed auto-save interval.
pub const MAX_INTERVAL_MS: u64 = 3_600_000;
/// Shortest allowed debounce window.
pub const MIN_DEBOUNCE_MS: u64 = 10;
/// Longest allowed debounce window.
pub const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Metadata store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Timeout for each metadata device operation
    pub io_timeout_ms: u64,
    /// Cap on persisted entries (defaults to the on-disk maximum)
    pub max_entries: Option<u32>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: 5_000,
            max_entries: None,
        }
    }
}

/// Auto-save scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Whether the periodic task is scheduled at all
    pub enabled: bool,
    /// Periodic save interval, clamped to [`MIN_INTERVAL_MS`, `MAX_INTERVAL_MS`]
    pub interval_ms: u64,
    /// Delay between a save request and the save, clamped to [`MIN_DEBOUNCE_MS`, `MAX_DEBOUNCE_MS`]
    pub debounce_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            debounce_ms: 100,
        }
    }
}

impl AutosaveConfig {
    /// Interval after clamping.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS))
    }

    /// Debounce window after clamping.
    pub fn effective_debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS))
    }
}

/// Configuration of one remap target instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Main device size in sectors
    pub main_sectors: u64,
    /// Spare device size in sectors
    pub spare_sectors: u64,
    /// Spare pool: the spare-device sectors handed out as replacements
    pub spare_pool: SectorRange,
    /// Reject I/O whose sectors fall inside the spare pool range
    #[serde(default = "default_true")]
    pub protect_spare_range: bool,
    /// Metadata settings
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Auto-save settings
    #[serde(default)]
    pub autosave: AutosaveConfig,
}

fn default_true() -> bool {
    true
}

impl TargetConfig {
    /// Creates a config whose spare pool starts right after the metadata region.
    pub fn new(main_sectors: u64, spare_sectors: u64, pool_len: u64) -> Self {
        Self {
            main_sectors,
            spare_sectors,
            spare_pool: SectorRange::new(METADATA_SECTORS, pool_len),
            protect_spare_range: true,
            metadata: MetadataConfig::default(),
            autosave: AutosaveConfig::default(),
        }
    }

    /// Checks that the spare pool is usable.
    ///
    /// `with_metadata` additionally requires the pool to stay clear of the
    /// metadata region at the start of the spare device.
    pub fn validate(&self, with_metadata: bool) -> RemapResult<()> {
        if self.spare_pool.is_empty() {
            return Err(RemapError::InvalidConfig {
                reason: "spare pool is empty".to_string(),
            });
        }
        if self.spare_pool.end() > self.spare_sectors || self.spare_pool.end() == u64::MAX {
            return Err(RemapError::InvalidConfig {
                reason: format!(
                    "spare pool {} exceeds spare device ({} sectors)",
                    self.spare_pool, self.spare_sectors
                ),
            });
        }
        if with_metadata && self.spare_pool.overlaps(&SectorRange::new(0, METADATA_SECTORS)) {
            return Err(RemapError::InvalidConfig {
                reason: format!(
                    "spare pool {} overlaps metadata region [0, {})",
                    self.spare_pool, METADATA_SECTORS
                ),
            });
        }
        Ok(())
    }

    /// Parses a JSON config.
    pub fn from_json_str(contents: &str) -> RemapResult<Self> {
        serde_json::from_str(contents).map_err(|e| RemapError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Loads a JSON config file.
    pub fn from_json_file(path: &Path) -> RemapResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
