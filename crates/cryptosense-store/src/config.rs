//! Storage configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Encrypted store settings.
///
/// Loaded from the `[sensor.storage]` section of `cryptosense.toml` or
/// `CRYPTOSENSE_SENSOR__STORAGE__*` environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Directory holding segment files and the encryption key.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Upper bound on the total size of segment files, in bytes.
    #[serde(default = "default_max_storage_size")]
    pub max_storage_size: u64,

    /// Segment size that triggers rotation, in bytes.
    #[serde(default = "default_rotation_size")]
    pub rotation_size: u64,

    /// Segments older than this many days are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Maximum number of discoveries held in memory awaiting submission.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,

    /// Hex-encoded 256-bit key. When unset the key is loaded from, or
    /// generated into, `encryption.key` under `data_path`.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/cryptosense")
}

fn default_max_storage_size() -> u64 {
    100 * 1024 * 1024
}

fn default_rotation_size() -> u64 {
    10 * 1024 * 1024
}

fn default_retention_days() -> u32 {
    7
}

fn default_pending_limit() -> usize {
    10_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            max_storage_size: default_max_storage_size(),
            rotation_size: default_rotation_size(),
            retention_days: default_retention_days(),
            pending_limit: default_pending_limit(),
            encryption_key: None,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `data_path`.
    pub fn at(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            ..Default::default()
        }
    }
}
