//! The encrypted rotating store.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use cryptosense_core::wire::StorageUpdate;
use cryptosense_core::{Discovery, DiscoveryId};

use crate::cipher::RecordCipher;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::export::ExportBlob;
use crate::segment::{self, ActiveSegment, SegmentContents, SegmentFile};

const SECS_PER_DAY: u64 = 86_400;

/// State guarded by the store lock. The pending buffer and the active
/// segment always change together.
#[derive(Debug)]
struct Inner {
    config: StoreConfig,
    pending: VecDeque<Discovery>,
    active: Option<ActiveSegment>,
    closed: bool,
}

/// Durable, encrypted, size-rotated log of discoveries plus the in-memory
/// buffer of discoveries awaiting submission.
///
/// ```text
/// {data_path}/
///   encryption.key
///   discoveries_20250101_120000.enc
///   discoveries_20250101_123012.enc   <- active
/// ```
#[derive(Debug)]
pub struct EncryptedStore {
    data_path: PathBuf,
    cipher: RecordCipher,
    inner: RwLock<Inner>,
}

impl EncryptedStore {
    /// Open a store under `config.data_path`, resolving the encryption key
    /// and creating the first segment.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_path)?;
        let cipher =
            RecordCipher::load_or_generate(&config.data_path, config.encryption_key.as_deref())?;
        let active = ActiveSegment::create(&config.data_path)?;

        tracing::info!(
            data_path = %config.data_path.display(),
            rotation_size = config.rotation_size,
            retention_days = config.retention_days,
            "Encrypted store opened"
        );

        Ok(Self {
            data_path: config.data_path.clone(),
            cipher,
            inner: RwLock::new(Inner {
                config,
                pending: VecDeque::new(),
                active: Some(active),
                closed: false,
            }),
        })
    }

    /// Current settings.
    pub fn config(&self) -> StoreConfig {
        self.inner.read().config.clone()
    }

    /// Apply new size and retention limits. Takes effect on the next write
    /// or cleanup.
    pub fn reconfigure(&self, update: &StorageUpdate) {
        let mut inner = self.inner.write();
        if let Some(v) = update.max_storage_size {
            inner.config.max_storage_size = v;
        }
        if let Some(v) = update.rotation_size {
            inner.config.rotation_size = v;
        }
        if let Some(v) = update.retention_days {
            inner.config.retention_days = v;
        }
        tracing::info!(
            max_storage_size = inner.config.max_storage_size,
            rotation_size = inner.config.rotation_size,
            retention_days = inner.config.retention_days,
            "Storage limits updated"
        );
    }

    pub fn cipher(&self) -> &RecordCipher {
        &self.cipher
    }

    /// Buffer `discovery` for submission and append it to the active segment.
    ///
    /// On a write error the discovery stays buffered in memory and the error
    /// is returned.
    pub fn append(&self, discovery: Discovery) -> Result<()> {
        let mut inner = self.inner.write();
        self.append_locked(&mut inner, discovery)
    }

    /// Append several discoveries under one lock acquisition. Every record
    /// is attempted; the first write error is returned.
    pub fn append_batch(&self, discoveries: Vec<Discovery>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut first_err = None;
        for discovery in discoveries {
            if let Err(e) = self.append_locked(&mut inner, discovery) {
                if matches!(e, StoreError::Closed) {
                    return Err(e);
                }
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn append_locked(&self, inner: &mut Inner, discovery: Discovery) -> Result<()> {
        if inner.closed {
            return Err(StoreError::Closed);
        }

        let plaintext = serde_json::to_vec(&discovery)?;
        buffer(inner, discovery);

        self.rotate_if_needed(inner)?;
        let sealed = self.cipher.seal(&plaintext)?;
        match inner.active.as_mut() {
            Some(active) => active.write_record(&sealed),
            None => Err(StoreError::Closed),
        }
    }

    /// Close the active segment and open a new one once it has reached the
    /// rotation threshold. Also reopens a segment lost to an earlier error.
    fn rotate_if_needed(&self, inner: &mut Inner) -> Result<()> {
        let needs_rotation = match &inner.active {
            Some(active) => active.size() >= inner.config.rotation_size,
            None => true,
        };
        if !needs_rotation {
            return Ok(());
        }

        if let Some(old) = inner.active.take() {
            let old_path = old.path().to_path_buf();
            let old_size = old.size();
            if let Err(e) = old.close() {
                tracing::warn!(path = %old_path.display(), error = %e, "Failed to sync rotated segment");
            }
            tracing::info!(path = %old_path.display(), size = old_size, "Rotated segment");
        }
        inner.active = Some(ActiveSegment::create(&self.data_path)?);
        Ok(())
    }

    /// Snapshot of up to `limit` buffered discoveries, oldest first.
    pub fn pending(&self, limit: usize) -> Vec<Discovery> {
        self.inner.read().pending.iter().take(limit).cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// Drop submitted discoveries from the buffer. Returns how many were
    /// removed.
    pub fn acknowledge(&self, ids: &[DiscoveryId]) -> usize {
        let ids: HashSet<&DiscoveryId> = ids.iter().collect();
        let mut inner = self.inner.write();
        let before = inner.pending.len();
        inner.pending.retain(|d| !ids.contains(&d.id));
        before - inner.pending.len()
    }

    /// Path of the segment currently receiving writes.
    pub fn active_segment(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .active
            .as_ref()
            .map(|a| a.path().to_path_buf())
    }

    /// Seal every buffered discovery into one export blob. The buffer is
    /// left untouched.
    pub fn export(&self, sensor_id: &str) -> Result<ExportBlob> {
        let inner = self.inner.read();
        let discoveries: Vec<Discovery> = inner.pending.iter().cloned().collect();
        ExportBlob::seal(&self.cipher, sensor_id, discoveries)
    }

    /// Decrypt every segment on disk, oldest first.
    pub fn read_all(&self) -> Result<Vec<Discovery>> {
        let _guard = self.inner.read();
        read_discoveries(&self.data_path, &self.cipher)
    }

    /// Purge segments past retention, then the oldest segments until the
    /// total fits `max_storage_size`. The active segment is never removed.
    /// Returns the number of files removed.
    pub fn cleanup(&self) -> Result<usize> {
        let inner = self.inner.read();
        let active = inner.active.as_ref().map(|a| a.path().to_path_buf());

        let retention = Duration::from_secs(u64::from(inner.config.retention_days) * SECS_PER_DAY);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let mut kept: Vec<SegmentFile> = Vec::new();
        for seg in segment::list_segments(&self.data_path)? {
            let is_active = active.as_deref() == Some(seg.path.as_path());
            if !is_active && seg.modified < cutoff && remove_segment(&seg, "retention") {
                removed += 1;
                continue;
            }
            kept.push(seg);
        }

        let mut total: u64 = kept.iter().map(|s| s.size).sum();
        for seg in &kept {
            if total <= inner.config.max_storage_size {
                break;
            }
            if active.as_deref() == Some(seg.path.as_path()) {
                continue;
            }
            if remove_segment(seg, "size_cap") {
                removed += 1;
                total -= seg.size;
            }
        }

        if removed > 0 {
            tracing::info!(removed, total_bytes = total, "Storage cleanup complete");
        }
        Ok(removed)
    }

    /// Flush and close the active segment. Later appends fail with
    /// [`StoreError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if let Some(active) = inner.active.take() {
            active.close()?;
        }
        tracing::info!(pending = inner.pending.len(), "Encrypted store closed");
        Ok(())
    }
}

fn buffer(inner: &mut Inner, discovery: Discovery) {
    inner.pending.push_back(discovery);
    if inner.pending.len() > inner.config.pending_limit {
        if let Some(evicted) = inner.pending.pop_front() {
            tracing::warn!(
                discovery_id = %evicted.id,
                limit = inner.config.pending_limit,
                "Pending buffer full, evicting oldest discovery (kept on disk)"
            );
        }
    }
}

fn remove_segment(seg: &SegmentFile, reason: &str) -> bool {
    match fs::remove_file(&seg.path) {
        Ok(()) => {
            tracing::debug!(path = %seg.path.display(), reason, "Removed segment");
            true
        }
        Err(e) => {
            tracing::warn!(path = %seg.path.display(), error = %e, "Failed to remove segment");
            false
        }
    }
}

/// Decrypt every segment in `dir`, oldest first, without opening a store.
/// Records that do not decode as discoveries are skipped.
pub fn read_discoveries(dir: &Path, cipher: &RecordCipher) -> Result<Vec<Discovery>> {
    let mut out = Vec::new();
    for seg in segment::list_segments(dir)? {
        let SegmentContents { records, .. } = segment::read_segment(&seg.path, cipher)?;
        for record in records {
            match serde_json::from_slice::<Discovery>(&record) {
                Ok(d) => out.push(d),
                Err(e) => tracing::warn!(
                    path = %seg.path.display(),
                    error = %e,
                    "Skipping undecodable record"
                ),
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptosense_core::{CryptoProtocol, DiscoveryMethod};

    fn discovery(port: u16) -> Discovery {
        Discovery::new(
            "sensor-1",
            "10.1.1.1".parse().unwrap(),
            "10.1.1.2".parse().unwrap(),
            port,
            CryptoProtocol::Ssh,
            DiscoveryMethod::Passive,
        )
    }

    fn open_store(dir: &std::path::Path) -> EncryptedStore {
        EncryptedStore::open(StoreConfig::at(dir)).unwrap()
    }

    #[test]
    fn append_buffers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(discovery(22)).unwrap();
        store.append(discovery(22)).unwrap();

        assert_eq!(store.pending_len(), 2);
        let on_disk = store.read_all().unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk, store.pending(10));
    }

    #[test]
    fn rapid_rotation_keeps_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            rotation_size: 1,
            ..StoreConfig::at(dir.path())
        };
        let store = EncryptedStore::open(config).unwrap();
        for port in 0..15 {
            store.append(discovery(port)).unwrap();
        }

        assert!(crate::segment::list_segments(dir.path()).unwrap().len() >= 15);
        let ports: Vec<u16> = store.read_all().unwrap().iter().map(|d| d.port).collect();
        assert_eq!(ports, (0..15).collect::<Vec<u16>>());
    }

    #[test]
    fn segments_are_readable_without_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(discovery(22)).unwrap();
        store.append(discovery(443)).unwrap();
        store.close().unwrap();
        let before = segment::list_segments(dir.path()).unwrap().len();

        let cipher = RecordCipher::load_or_generate(dir.path(), None).unwrap();
        let ports: Vec<u16> = read_discoveries(dir.path(), &cipher)
            .unwrap()
            .iter()
            .map(|d| d.port)
            .collect();
        assert_eq!(ports, vec![22, 443]);
        assert_eq!(segment::list_segments(dir.path()).unwrap().len(), before);
    }

    #[test]
    fn acknowledge_removes_only_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .append_batch((0..5).map(|_| discovery(443)).collect())
            .unwrap();

        let batch = store.pending(3);
        let ids: Vec<DiscoveryId> = batch.iter().map(|d| d.id).collect();
        store.append(discovery(993)).unwrap();

        assert_eq!(store.acknowledge(&ids), 3);
        let rest = store.pending(100);
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2].port, 993);
        assert_eq!(store.acknowledge(&ids), 0);
    }

    #[test]
    fn pending_limit_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            pending_limit: 2,
            ..StoreConfig::at(dir.path())
        };
        let store = EncryptedStore::open(config).unwrap();
        for port in [1, 2, 3] {
            store.append(discovery(port)).unwrap();
        }
        let ports: Vec<u16> = store.pending(10).iter().map(|d| d.port).collect();
        assert_eq!(ports, vec![2, 3]);
        assert_eq!(store.read_all().unwrap().len(), 3);
    }

    #[test]
    fn closed_store_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.append(discovery(22)), Err(StoreError::Closed)));
        assert!(store.active_segment().is_none());
    }

    #[test]
    fn export_leaves_buffer_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(discovery(465)).unwrap();
        let blob = store.export("sensor-1").unwrap();
        assert_eq!(blob.record_count, 1);
        assert_eq!(store.pending_len(), 1);

        let payload = crate::export::open(store.cipher(), &blob.to_wire()).unwrap();
        assert_eq!(payload.discoveries[0].port, 465);
    }
}
