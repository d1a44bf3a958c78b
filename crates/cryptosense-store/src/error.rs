//! Error types for the cryptosense-store crate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: record is corrupt or was sealed with another key")]
    Decrypt,

    #[error("Store is closed")]
    Closed,

    #[error("Export checksum mismatch for {export_id}")]
    ChecksumMismatch { export_id: String },

    #[error("Not a segment file: {0}")]
    NotASegment(PathBuf),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
