//! Configuration for the cryptosense sensor.

use std::path::PathBuf;

use serde::Deserialize;

use cryptosense_core::wire::ConfigUpdate;
use cryptosense_core::{features, DeploymentProfile, FeatureFlags};
use cryptosense_store::StoreConfig;

use crate::error::{Result, SensorError};

/// Top-level sensor configuration.
///
/// Loaded from `cryptosense.toml` `[sensor]` section or
/// `CRYPTOSENSE_SENSOR__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Human-readable sensor name, also the CN of its client certificate.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Platform label reported at registration (default: host OS).
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub profile: DeploymentProfile,

    /// Base URL of the manager.
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,

    /// Single-use key issued by an operator. Only needed until the first
    /// successful registration.
    #[serde(default)]
    pub registration_key: Option<String>,

    /// IP address the registration key is bound to.
    #[serde(default)]
    pub ip_address: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub reporting: ReportingConfig,

    #[serde(default)]
    pub storage: StoreConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default = "default_features")]
    pub features: FeatureFlags,

    #[serde(default)]
    pub security: SecurityConfig,
}

/// Outbound reporting cadence.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReportingConfig {
    /// Seconds between heartbeat/submission cycles.
    #[serde(default = "default_reporting_interval")]
    pub interval_secs: u64,

    /// Maximum discoveries per submitted batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout applied to every outbound request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds between storage retention sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Capture pipeline settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CaptureConfig {
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    /// Kernel capture buffer per interface, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Read timeout so reader loops observe cancellation promptly.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: i32,

    /// Bounded queue between reader loops and the worker pool.
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,

    /// Bounded discovery queue between workers and the store.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Classification workers (default: available CPUs).
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default = "default_true")]
    pub active_probing: bool,

    #[serde(default = "default_true")]
    pub network_discovery: bool,

    /// Maximum concurrent active probes.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-probe timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Client certificate material provisioned outside the registration flow.
/// Identity issued at registration takes precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub server_ca_cert: Option<PathBuf>,
}

fn default_name() -> String {
    "crypto-sensor".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_control_plane_url() -> String {
    "http://localhost:8085".to_string()
}

fn default_reporting_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_snaplen() -> i32 {
    65535
}

fn default_read_timeout_ms() -> i32 {
    500
}

fn default_frame_queue_size() -> usize {
    4096
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_features() -> FeatureFlags {
    features::ALL
        .iter()
        .map(|name| (name.to_string(), *name != features::AIR_GAPPED_EXPORT))
        .collect()
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reporting_interval(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            buffer_size: default_buffer_size(),
            snaplen: default_snaplen(),
            promiscuous: true,
            read_timeout_ms: default_read_timeout_ms(),
            frame_queue_size: default_frame_queue_size(),
            queue_size: default_queue_size(),
            workers: None,
            active_probing: true,
            network_discovery: true,
            max_connections: default_max_connections(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl CaptureConfig {
    /// Worker pool size, falling back to the number of available CPUs.
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: String::new(),
            platform: default_platform(),
            profile: DeploymentProfile::default(),
            control_plane_url: default_control_plane_url(),
            registration_key: None,
            ip_address: None,
            tags: Vec::new(),
            reporting: ReportingConfig::default(),
            storage: StoreConfig::default(),
            capture: CaptureConfig::default(),
            features: default_features(),
            security: SecurityConfig::default(),
        }
    }
}

impl SensorConfig {
    /// Whether `feature` is switched on. Unknown features are off.
    pub fn feature(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }

    /// Active probing needs both the feature flag and the capture toggle.
    pub fn probing_enabled(&self) -> bool {
        self.capture.active_probing && self.feature(features::ACTIVE_PROBING)
    }

    /// Merge a partial update from the control plane.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(secs) = update.reporting_interval.filter(|s| *s > 0) {
            self.reporting.interval_secs = secs;
        }
        if let Some(storage) = &update.storage {
            if let Some(v) = storage.max_storage_size {
                self.storage.max_storage_size = v;
            }
            if let Some(v) = storage.rotation_size {
                self.storage.rotation_size = v;
            }
            if let Some(v) = storage.retention_days {
                self.storage.retention_days = v;
            }
        }
        if let Some(capture) = &update.capture {
            if let Some(v) = capture.active_probing {
                self.capture.active_probing = v;
            }
            if let Some(v) = capture.network_discovery {
                self.capture.network_discovery = v;
            }
            if let Some(v) = capture.max_connections.filter(|n| *n > 0) {
                self.capture.max_connections = v;
            }
            if let Some(v) = capture.timeout_seconds.filter(|s| *s > 0) {
                self.capture.timeout_seconds = v;
            }
        }
        for (name, enabled) in &update.features {
            self.features.insert(name.clone(), *enabled);
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capture.interfaces.is_empty() {
            return Err(SensorError::Config("no capture interfaces configured".into()));
        }
        if self.reporting.interval_secs == 0 {
            return Err(SensorError::Config("reporting interval must be > 0".into()));
        }
        if self.capture.queue_size == 0 || self.capture.frame_queue_size == 0 {
            return Err(SensorError::Config("queue sizes must be > 0".into()));
        }
        if self.storage.rotation_size == 0 {
            return Err(SensorError::Config("rotation size must be > 0".into()));
        }
        Ok(())
    }
}

/// Load `[sensor]` from `<file_prefix>.toml` (optional) and
/// `CRYPTOSENSE_SENSOR__*` environment variables.
pub fn load(file_prefix: &str) -> Result<SensorConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("CRYPTOSENSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("sensor.capture.interfaces")
                .with_list_parse_key("sensor.tags"),
        )
        .build()
        .map_err(|e| SensorError::Config(e.to_string()))?;

    match cfg.get::<SensorConfig>("sensor") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(SensorConfig::default()),
        Err(e) => Err(SensorError::Config(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptosense_core::wire::{CaptureUpdate, StorageUpdate};

    #[test]
    fn test_default_config() {
        let config = SensorConfig::default();
        assert_eq!(config.name, "crypto-sensor");
        assert_eq!(config.control_plane_url, "http://localhost:8085");
        assert_eq!(config.reporting.interval_secs, 30);
        assert_eq!(config.reporting.batch_size, 100);
        assert_eq!(config.capture.interfaces, vec!["eth0"]);
        assert_eq!(config.capture.queue_size, 1000);
        assert_eq!(config.capture.max_connections, 1000);
        assert!(config.feature(features::TLS_ANALYSIS));
        assert!(!config.feature(features::AIR_GAPPED_EXPORT));
        assert!(config.probing_enabled());
        config.validate().unwrap();
    }

    #[test]
    fn apply_partial_update() {
        let mut config = SensorConfig::default();
        let update = ConfigUpdate {
            reporting_interval: Some(300),
            storage: Some(StorageUpdate {
                retention_days: Some(30),
                ..Default::default()
            }),
            capture: Some(CaptureUpdate {
                active_probing: Some(false),
                max_connections: Some(0),
                ..Default::default()
            }),
            features: [(features::SSH_ANALYSIS.to_string(), false)].into(),
        };
        config.apply(&update);

        assert_eq!(config.reporting.interval_secs, 300);
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.storage.rotation_size, 10 * 1024 * 1024);
        assert!(!config.capture.active_probing);
        assert_eq!(config.capture.max_connections, 1000);
        assert!(!config.feature(features::SSH_ANALYSIS));
        assert!(!config.probing_enabled());
    }

    #[test]
    fn zero_interval_ignored() {
        let mut config = SensorConfig::default();
        config.apply(&ConfigUpdate {
            reporting_interval: Some(0),
            ..Default::default()
        });
        assert_eq!(config.reporting.interval_secs, 30);
    }

    #[test]
    fn empty_interfaces_rejected() {
        let mut config = SensorConfig::default();
        config.capture.interfaces.clear();
        assert!(matches!(config.validate(), Err(SensorError::Config(_))));
    }

    #[test]
    fn worker_count_never_zero() {
        let capture = CaptureConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(capture.worker_count() >= 1);
    }
}
