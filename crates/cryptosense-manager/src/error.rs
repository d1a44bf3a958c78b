//! Error types for the cryptosense-manager crate.

use thiserror::Error;

/// Why a registration or pending-key operation was refused. Each variant
/// has a stable machine-readable code returned to clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Registration key not found")]
    UnknownKey,

    #[error("Registration key has expired")]
    KeyExpired,

    #[error("Registration key has already been used")]
    KeyUsed,

    #[error("IP address {declared} does not match the address bound to this key")]
    IpMismatch { declared: String },

    #[error("Request came from {actual}, but the sensor declared {declared}")]
    ClientIpMismatch { declared: String, actual: String },

    #[error("Maximum number of pending sensors ({0}) reached")]
    CapacityReached(usize),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Certificate issuance failed: {0}")]
    Certificate(String),
}

impl RegistrationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIp(_) => "invalid_ip",
            Self::UnknownKey => "unknown_key",
            Self::KeyExpired => "key_expired",
            Self::KeyUsed => "key_used",
            Self::IpMismatch { .. } => "ip_mismatch",
            Self::ClientIpMismatch { .. } => "client_ip_mismatch",
            Self::CapacityReached(_) => "capacity_reached",
            Self::InvalidSettings(_) => "invalid_settings",
            Self::Certificate(_) => "certificate",
        }
    }
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Path sensor {path} does not match body sensor {body}")]
    SensorIdMismatch { path: String, body: String },

    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("Unknown command {command_id} for sensor {sensor_id}")]
    UnknownCommand {
        sensor_id: String,
        command_id: String,
    },

    #[error("Invalid export: {0}")]
    Export(#[from] cryptosense_store::StoreError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registration(e) => e.code(),
            Self::Certificate(_) => "certificate",
            Self::SensorIdMismatch { .. } => "sensor_id_mismatch",
            Self::UnknownSensor(_) => "unknown_sensor",
            Self::UnknownCommand { .. } => "unknown_command",
            Self::Export(_) => "invalid_export",
            Self::Config(_) | Self::Server(_) | Self::Serialization(_) | Self::Io(_) => "internal",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Registration(RegistrationError::Certificate(_)) | Self::Certificate(_) => 500,
            Self::Registration(_) | Self::SensorIdMismatch { .. } | Self::Export(_) => 400,
            Self::UnknownSensor(_) | Self::UnknownCommand { .. } => 404,
            Self::Config(_) | Self::Server(_) | Self::Serialization(_) | Self::Io(_) => 500,
        }
    }
}

impl warp::reject::Reject for ManagerError {}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_errors_are_client_errors() {
        let err = ManagerError::from(RegistrationError::KeyUsed);
        assert_eq!(err.code(), "key_used");
        assert_eq!(err.status(), 400);

        let err = ManagerError::from(RegistrationError::Certificate("boom".into()));
        assert_eq!(err.code(), "certificate");
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn mismatch_code() {
        let err = ManagerError::SensorIdMismatch {
            path: "a".into(),
            body: "b".into(),
        };
        assert_eq!(err.code(), "sensor_id_mismatch");
        assert_eq!(err.status(), 400);
    }
}
