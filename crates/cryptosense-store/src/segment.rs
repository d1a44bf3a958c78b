//! Segment files.
//!
//! A segment is a file named `discoveries_<YYYYMMDD_HHMMSS>.enc` holding a
//! sequence of sealed records, each followed by a `\n` delimiter:
//!
//! ```text
//! nonce(12) || ciphertext+tag || '\n'
//! nonce(12) || ciphertext+tag || '\n'
//! ...
//! ```
//!
//! The ciphertext is binary and may itself contain `\n`, so a newline is
//! only a candidate boundary. The reader accepts the shortest candidate
//! whose bytes authenticate.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::cipher::{private_options, RecordCipher, MIN_SEALED_LEN};
use crate::error::{Result, StoreError};

pub const SEGMENT_PREFIX: &str = "discoveries_";
pub const SEGMENT_EXTENSION: &str = "enc";
const DELIMITER: u8 = b'\n';

/// File name for a segment created at `at`. `seq > 0` disambiguates
/// segments created within the same second.
pub fn segment_name(at: DateTime<Utc>, seq: u32) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    if seq == 0 {
        format!("{SEGMENT_PREFIX}{stamp}.{SEGMENT_EXTENSION}")
    } else {
        format!("{SEGMENT_PREFIX}{stamp}_{seq:04}.{SEGMENT_EXTENSION}")
    }
}

/// Creation order of a segment: its timestamp, then its numeric sequence.
fn segment_order(path: &Path) -> (String, u32) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(SEGMENT_PREFIX))
        .unwrap_or_default();
    match stem.rsplit_once('_') {
        // The stamp itself contains one '_' (date_time).
        Some((stamp, seq)) if stamp.contains('_') => {
            (stamp.to_string(), seq.parse().unwrap_or(u32::MAX))
        }
        _ => (stem.to_string(), 0),
    }
}

/// Whether `path` names a segment file.
pub fn is_segment(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(SEGMENT_PREFIX)
        && path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
}

/// A segment file found on disk.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// List segment files in `dir`, oldest first.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    if !dir.is_dir() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_segment(&path) {
            continue;
        }
        let meta = entry.metadata()?;
        segments.push(SegmentFile {
            path,
            size: meta.len(),
            modified: meta.modified()?,
        });
    }

    segments.sort_by_cached_key(|s| segment_order(&s.path));
    Ok(segments)
}

/// The segment currently receiving writes.
#[derive(Debug)]
pub(crate) struct ActiveSegment {
    path: PathBuf,
    file: File,
    size: u64,
}

impl ActiveSegment {
    /// Create a fresh segment in `dir` with a unique, timestamped name.
    pub(crate) fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let now = Utc::now();
        let mut seq = 0;
        loop {
            let path = dir.join(segment_name(now, seq));
            match private_options().open(&path) {
                Ok(file) => {
                    tracing::debug!(path = %path.display(), "Opened segment");
                    return Ok(Self {
                        path,
                        file,
                        size: 0,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Append one sealed record and its delimiter.
    pub(crate) fn write_record(&mut self, sealed: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(sealed.len() + 1);
        framed.extend_from_slice(sealed);
        framed.push(DELIMITER);
        self.file.write_all(&framed)?;
        self.file.flush()?;
        self.size += framed.len() as u64;
        Ok(())
    }

    /// Flush to disk and release the handle.
    pub(crate) fn close(self) -> Result<()> {
        self.file.sync_all()?;
        tracing::debug!(path = %self.path.display(), size = self.size, "Closed segment");
        Ok(())
    }
}

/// Decrypted contents of a segment.
#[derive(Debug, Default)]
pub struct SegmentContents {
    /// Plaintext records in write order.
    pub records: Vec<Vec<u8>>,
    /// Number of unreadable regions skipped.
    pub corrupt: usize,
}

/// Decrypt every record in the segment at `path`.
pub fn read_segment(path: &Path, cipher: &RecordCipher) -> Result<SegmentContents> {
    if !is_segment(path) {
        return Err(StoreError::NotASegment(path.to_path_buf()));
    }
    let data = fs::read(path)?;
    Ok(split_records(&data, cipher))
}

pub(crate) fn split_records(data: &[u8], cipher: &RecordCipher) -> SegmentContents {
    let mut contents = SegmentContents::default();
    let mut start = 0;
    let mut in_corrupt_region = false;

    while start < data.len() {
        match next_record(data, start, cipher) {
            Some((plaintext, end)) => {
                contents.records.push(plaintext);
                start = end + 1;
                in_corrupt_region = false;
            }
            None => {
                if !in_corrupt_region {
                    contents.corrupt += 1;
                    in_corrupt_region = true;
                }
                // Resynchronise on the next delimiter.
                match data[start..].iter().position(|b| *b == DELIMITER) {
                    Some(offset) => start += offset + 1,
                    None => break,
                }
            }
        }
    }

    if contents.corrupt > 0 {
        tracing::warn!(
            corrupt = contents.corrupt,
            recovered = contents.records.len(),
            "Segment contains unreadable records"
        );
    }
    contents
}

/// Find the shortest authenticated record starting at `start`. Returns the
/// plaintext and the index of its delimiter.
fn next_record(data: &[u8], start: usize, cipher: &RecordCipher) -> Option<(Vec<u8>, usize)> {
    let first_candidate = start + MIN_SEALED_LEN;
    if first_candidate >= data.len() {
        return None;
    }
    data[first_candidate..]
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == DELIMITER)
        .map(|(i, _)| first_candidate + i)
        .find_map(|end| cipher.open(&data[start..end]).ok().map(|p| (p, end)))
}
