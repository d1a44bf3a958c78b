use thiserror::Error;

/// Top-level error type for shared CryptoSense types.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("Invalid payload for command {command}: {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
