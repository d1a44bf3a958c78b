//! Discovery records.
//!
//! A discovery is one observed use of a cryptographic protocol on the wire.
//! It is produced by the fingerprint engine, persisted by the encrypted store
//! and submitted to the control plane in batches.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Identifiers ───────────────────────────────────────────────────

/// Unique identifier for a discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DiscoveryId(pub Uuid);

impl DiscoveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DiscoveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DiscoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────

/// Cryptographic protocol family recognised by the sensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CryptoProtocol {
    #[serde(rename = "TLS")]
    Tls,
    #[serde(rename = "SSH")]
    Ssh,
}

impl CryptoProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "TLS",
            Self::Ssh => "SSH",
        }
    }
}

impl fmt::Display for CryptoProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a discovery was obtained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    /// Observed on a capture interface.
    #[default]
    Passive,
    /// Obtained by connecting to the endpoint.
    Active,
}

// ── Confidence ────────────────────────────────────────────────────

/// Classification confidence, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Port-based heuristic only.
    pub const PORT_HEURISTIC: Confidence = Confidence(0.8);
    /// A handshake message (or SSH identification string) was parsed.
    pub const HANDSHAKE: Confidence = Confidence(0.9);
    /// A certificate message was parsed.
    pub const CERTIFICATE: Confidence = Confidence(0.95);

    /// Build a confidence value, clamping into `[0, 1]`. NaN becomes 0.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = CoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CoreError::InvalidConfidence(value))
        }
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> Self {
        c.0
    }
}

// ── Discovery ─────────────────────────────────────────────────────

/// A single observed cryptographic-protocol usage event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discovery {
    pub id: DiscoveryId,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    /// The well-known port that matched (server side of the flow).
    pub port: u16,
    pub protocol: CryptoProtocol,
    pub protocol_version: String,
    pub discovery_method: DiscoveryMethod,
    confidence: Confidence,
    #[serde(default)]
    pub raw_metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Discovery {
    /// Create a discovery at the port-heuristic confidence level.
    pub fn new(
        sensor_id: impl Into<String>,
        source_ip: IpAddr,
        dest_ip: IpAddr,
        port: u16,
        protocol: CryptoProtocol,
        discovery_method: DiscoveryMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DiscoveryId::new(),
            sensor_id: sensor_id.into(),
            timestamp: now,
            source_ip,
            dest_ip,
            port,
            protocol,
            protocol_version: "Unknown".to_string(),
            discovery_method,
            confidence: Confidence::PORT_HEURISTIC,
            raw_metadata: serde_json::Map::new(),
            created_at: now,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence.value()
    }

    /// Raise confidence to at least `to`. Never lowers it.
    pub fn raise_confidence(&mut self, to: Confidence) {
        if to > self.confidence {
            self.confidence = to;
        }
    }

    /// Insert a metadata entry, replacing any previous value for `key`.
    pub fn tag(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.raw_metadata.insert(key.to_string(), value.into());
    }
}
