//! Air-gapped export blobs.
//!
//! An export is a single sealed JSON document listing discoveries, meant to
//! be carried out of a disconnected network or uploaded in one request.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cryptosense_core::wire::AirGappedExport;
use cryptosense_core::Discovery;

use crate::cipher::RecordCipher;
use crate::error::{Result, StoreError};

/// Plaintext document sealed inside an export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportPayload {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    pub discoveries: Vec<Discovery>,
}

/// A sealed export ready to be written out or uploaded.
#[derive(Debug, Clone)]
pub struct ExportBlob {
    pub export_id: String,
    pub sensor_id: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    /// `nonce || ciphertext` of the JSON payload.
    pub sealed: Vec<u8>,
}

impl ExportBlob {
    /// Seal `discoveries` into a new export.
    pub fn seal(
        cipher: &RecordCipher,
        sensor_id: &str,
        discoveries: Vec<Discovery>,
    ) -> Result<Self> {
        let created_at = Utc::now();
        let payload = ExportPayload {
            sensor_id: sensor_id.to_string(),
            timestamp: created_at,
            count: discoveries.len(),
            discoveries,
        };
        let json = serde_json::to_vec(&payload)?;
        let sealed = cipher.seal(&json)?;

        Ok(Self {
            export_id: Uuid::new_v4().to_string(),
            sensor_id: payload.sensor_id,
            created_at,
            record_count: payload.count,
            sealed,
        })
    }

    /// BLAKE3 hex digest of the sealed bytes.
    pub fn checksum(&self) -> String {
        blake3::hash(&self.sealed).to_hex().to_string()
    }

    /// Transport form with base64 data and checksum.
    pub fn to_wire(&self) -> AirGappedExport {
        AirGappedExport {
            export_id: self.export_id.clone(),
            sensor_id: self.sensor_id.clone(),
            created_at: self.created_at,
            record_count: self.record_count,
            checksum: self.checksum(),
            data: BASE64.encode(&self.sealed),
        }
    }
}

/// Verify the checksum of a transported export and return its sealed bytes.
pub fn verify(export: &AirGappedExport) -> Result<Vec<u8>> {
    let sealed = BASE64.decode(export.data.as_bytes())?;
    let actual = blake3::hash(&sealed).to_hex().to_string();
    if actual != export.checksum {
        return Err(StoreError::ChecksumMismatch {
            export_id: export.export_id.clone(),
        });
    }
    Ok(sealed)
}

/// Verify and decrypt a transported export.
pub fn open(cipher: &RecordCipher, export: &AirGappedExport) -> Result<ExportPayload> {
    let sealed = verify(export)?;
    let json = cipher.open(&sealed)?;
    Ok(serde_json::from_slice(&json)?)
}
