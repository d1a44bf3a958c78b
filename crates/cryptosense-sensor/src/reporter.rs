//! Periodic reporting to the control plane.
//!
//! Each cycle drains the pending buffer in batches, then sends a heartbeat
//! whose response carries queued commands. Buffered discoveries are only
//! dropped once the manager has accepted the batch holding them, so a
//! failed cycle is retried in full by the next one (at-least-once).
//! Air-gapped sensors write an export file instead of calling out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use cryptosense_core::wire::{AirGappedExport, Command, ExportReceipt, SensorStatus};
use cryptosense_core::{Discovery, DiscoveryId};
use cryptosense_store::{read_discoveries, EncryptedStore, ExportBlob, RecordCipher, StoreConfig};

use crate::client::{ClientError, OutboundClient};
use crate::error::{Result, SensorError};
use crate::health::{HealthCounters, HealthSampler};

/// Directory under the data path receiving air-gapped export files.
pub const EXPORT_DIR: &str = "exports";

/// Everything a reporting cycle needs, cheap to clone into a task.
#[derive(Clone)]
pub struct Reporter {
    pub sensor_id: String,
    pub store: Arc<EncryptedStore>,
    pub client: OutboundClient,
    pub counters: Arc<HealthCounters>,
    pub sampler: Arc<Mutex<HealthSampler>>,
    pub batch_size: usize,
    pub air_gapped: bool,
    pub export_dir: PathBuf,
}

impl Reporter {
    /// Run one reporting cycle and return the commands received.
    pub async fn cycle(&self, capture_running: bool) -> Vec<Command> {
        if self.air_gapped {
            if let Err(e) = self.export_pending() {
                self.counters.error();
                tracing::error!(error = %e, "Air-gapped export failed");
            }
            return Vec::new();
        }

        let status = match self.submit_pending().await {
            Ok(_) => SensorStatus::Healthy,
            Err(e) => {
                self.counters.submission_failed();
                tracing::warn!(
                    error = %e,
                    pending = self.store.pending_len(),
                    "Discovery submission failed, will retry next cycle"
                );
                SensorStatus::Degraded
            }
        };

        let health = self.sampler.lock().sample(
            &self.sensor_id,
            status,
            &self.counters,
            self.store.pending_len(),
            capture_running,
        );
        match self.client.heartbeat(&self.sensor_id, &health).await {
            Ok(commands) => {
                if !commands.is_empty() {
                    tracing::info!(count = commands.len(), "Received commands");
                }
                commands
            }
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat failed");
                Vec::new()
            }
        }
    }

    /// Submit buffered discoveries in `batch_size` chunks, dropping each
    /// chunk from the buffer once accepted. Stops at the first failure.
    /// Returns how many discoveries were accepted.
    pub async fn submit_pending(&self) -> std::result::Result<usize, ClientError> {
        let batch_size = self.batch_size.max(1);
        // Bounded by what was buffered when the cycle began so a busy
        // capture cannot keep one cycle going forever.
        let rounds = self.store.pending_len().div_ceil(batch_size);

        let mut accepted = 0;
        for _ in 0..rounds {
            let batch = self.store.pending(batch_size);
            if batch.is_empty() {
                break;
            }
            let ids: Vec<DiscoveryId> = batch.iter().map(|d| d.id).collect();
            let receipt = self.client.submit_discoveries(&self.sensor_id, batch).await?;
            let removed = self.store.acknowledge(&ids);
            accepted += removed;
            tracing::info!(
                batch_id = %receipt.batch_id,
                count = removed,
                remaining = self.store.pending_len(),
                "Submitted discoveries"
            );
        }
        Ok(accepted)
    }

    /// Seal the pending buffer into an export file and drop what it holds.
    pub fn export_pending(&self) -> Result<Option<PathBuf>> {
        let pending = self.store.pending(usize::MAX);
        if pending.is_empty() {
            return Ok(None);
        }
        let ids: Vec<DiscoveryId> = pending.iter().map(|d| d.id).collect();
        let (export, path) =
            write_export(self.store.cipher(), &self.sensor_id, pending, &self.export_dir)?;
        self.store.acknowledge(&ids);
        tracing::info!(
            export_id = %export.export_id,
            records = export.record_count,
            path = %path.display(),
            "Wrote air-gapped export"
        );
        Ok(Some(path))
    }
}

/// Seal `discoveries` and write the transport JSON to `<dir>/<export_id>.json`.
pub fn write_export(
    cipher: &RecordCipher,
    sensor_id: &str,
    discoveries: Vec<Discovery>,
    dir: &Path,
) -> Result<(AirGappedExport, PathBuf)> {
    let export = ExportBlob::seal(cipher, sensor_id, discoveries)?.to_wire();
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", export.export_id));
    fs::write(&path, serde_json::to_vec_pretty(&export)?)?;
    Ok((export, path))
}

/// Cipher of an existing store. Never generates a key.
pub fn existing_cipher(storage: &StoreConfig) -> Result<RecordCipher> {
    let key_path = storage.data_path.join(cryptosense_store::cipher::KEY_FILE);
    if storage.encryption_key.is_none() && !key_path.exists() {
        return Err(SensorError::Config(format!(
            "no encryption key at {}",
            key_path.display()
        )));
    }
    Ok(RecordCipher::load_or_generate(
        &storage.data_path,
        storage.encryption_key.as_deref(),
    )?)
}

/// Export every discovery on disk under `storage` into `dir`. Segments are
/// only read, so a stopped sensor's data directory is left as it was.
pub fn export_stored(
    storage: &StoreConfig,
    sensor_id: &str,
    dir: &Path,
) -> Result<(AirGappedExport, PathBuf)> {
    let cipher = existing_cipher(storage)?;
    let discoveries = read_discoveries(&storage.data_path, &cipher)?;
    write_export(&cipher, sensor_id, discoveries, dir)
}

/// Submit an export file written by [`write_export`] once the sensor has a
/// route to the control plane again.
pub async fn upload_export(client: &OutboundClient, path: &Path) -> Result<ExportReceipt> {
    let export: AirGappedExport = serde_json::from_slice(&fs::read(path)?)?;
    let receipt = client.submit_export(&export).await?;
    tracing::info!(
        export_id = %receipt.export_id,
        records = receipt.records,
        path = %path.display(),
        "Uploaded air-gapped export"
    );
    Ok(receipt)
}
