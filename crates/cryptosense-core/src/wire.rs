//! HTTP/JSON messages exchanged between sensor and manager.
//!
//! The sensor always initiates. Every request and response body defined
//! here is snake_case JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::profile::{DeploymentProfile, FeatureFlags};
use crate::types::Discovery;

// ── Health ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    #[default]
    Healthy,
    /// Capture or submission is failing but the sensor is still reporting.
    Degraded,
    Stopping,
}

/// Health report carried by every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorHealth {
    pub sensor_id: String,
    pub status: SensorStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime_seconds: u64,
    /// Resident memory of the sensor process, in bytes.
    pub memory_usage: u64,
    /// CPU usage of the sensor process, in percent.
    pub cpu_usage: f32,
    pub packets_captured: u64,
    pub frames_dropped: u64,
    pub discoveries_made: u64,
    pub discoveries_dropped: u64,
    pub pending_submissions: u64,
    pub errors: u64,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

// ── Commands ──────────────────────────────────────────────────────

/// Kind of remote command. Unrecognised kinds survive decoding so they can
/// be logged and acknowledged as ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    UpdateConfig,
    Restart,
    Stop,
    StartCapture,
    StopCapture,
    Unknown(String),
}

impl CommandType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UpdateConfig => "update_config",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::StartCapture => "start_capture",
            Self::StopCapture => "stop_capture",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for CommandType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "update_config" => Self::UpdateConfig,
            "restart" => Self::Restart,
            "stop" => Self::Stop,
            "start_capture" => Self::StartCapture,
            "stop_capture" => Self::StopCapture,
            _ => Self::Unknown(s),
        }
    }
}

impl From<CommandType> for String {
    fn from(c: CommandType) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command delivered to a sensor in a heartbeat or poll response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub requires_ack: bool,
}

impl Command {
    pub fn new(kind: CommandType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority: 0,
            payload: serde_json::Map::new(),
            requires_ack: true,
        }
    }

    /// A reconfiguration command carrying `update` under `payload.config`.
    pub fn update_config(update: &ConfigUpdate) -> Result<Self> {
        let mut cmd = Self::new(CommandType::UpdateConfig);
        cmd.payload
            .insert("config".to_string(), serde_json::to_value(update)?);
        Ok(cmd)
    }

    /// Decode the `payload.config` object of an `update_config` command.
    pub fn config_update(&self) -> Result<ConfigUpdate> {
        let raw = self
            .payload
            .get("config")
            .ok_or_else(|| CoreError::InvalidPayload {
                command: self.kind.to_string(),
                reason: "missing `config` object".to_string(),
            })?;
        serde_json::from_value(raw.clone()).map_err(|e| CoreError::InvalidPayload {
            command: self.kind.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Commands queued for one sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SensorCommands {
    pub sensor_id: String,
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Processed,
    Failed,
    Ignored,
}

/// Acknowledgement of a processed command. Signals receipt, not success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub command_id: String,
    pub sensor_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ── Configuration updates ─────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_storage_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptureUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_probing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_discovery: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Partial reconfiguration. Absent fields leave the current value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdate {
    /// Seconds between reporting cycles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureUpdate>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: FeatureFlags,
}

// ── Discoveries ───────────────────────────────────────────────────

/// One submission of buffered discoveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryBatch {
    pub sensor_id: String,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    pub discoveries: Vec<Discovery>,
}

impl DiscoveryBatch {
    /// Wrap discoveries in a batch with a fresh batch id.
    pub fn new(sensor_id: impl Into<String>, discoveries: Vec<Discovery>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            batch_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            count: discoveries.len(),
            discoveries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub accepted: usize,
}

// ── Air-gapped export ─────────────────────────────────────────────

/// An encrypted export of buffered discoveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AirGappedExport {
    pub export_id: String,
    pub sensor_id: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    /// BLAKE3 hex digest of the encrypted bytes.
    pub checksum: String,
    /// Base64 of `nonce || ciphertext`.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportReceipt {
    pub status: String,
    pub export_id: String,
    pub records: usize,
}

// ── Registration ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationRequest {
    pub registration_key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub network_interfaces: Vec<String>,
    pub ip_address: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Identity and initial configuration issued on successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationResponse {
    pub sensor_id: String,
    pub tenant_id: String,
    pub client_cert: String,
    pub client_key: String,
    pub server_ca_cert: String,
    pub control_plane_url: String,
    pub reporting_interval: u64,
    pub features: FeatureFlags,
    #[serde(default)]
    pub config: ConfigUpdate,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Used,
    Expired,
}

/// A pre-issued, single-use, time-bound registration credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRegistration {
    pub id: String,
    pub registration_key: String,
    pub name: String,
    pub bound_ip: String,
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub network_interfaces: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PendingStatus,
}

/// Operator request to pre-issue a registration key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatePendingRequest {
    pub name: String,
    pub ip_address: String,
    #[serde(default)]
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub network_interfaces: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatePendingResponse {
    pub pending_sensor: PendingRegistration,
    pub installation_command: String,
}

/// Manager-wide registration policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminSettings {
    pub key_expiration_minutes: i64,
    pub max_pending_sensors: usize,
    pub require_ip_validation: bool,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            key_expiration_minutes: 60,
            max_pending_sensors: 50,
            require_ip_validation: true,
        }
    }
}

/// Error body returned by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
