//! Error types for the cryptosense-sensor crate.

use thiserror::Error;

use crate::capture::CaptureError;
use crate::client::ClientError;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Sensor is not registered: {0}")]
    NotRegistered(String),

    #[error("Store error: {0}")]
    Store(#[from] cryptosense_store::StoreError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Control plane error: {0}")]
    Client(#[from] ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SensorError>;
