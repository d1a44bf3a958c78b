//! CryptoSense Store: durable, encrypted discovery log.
//!
//! Discoveries are sealed one record at a time with AES-256-GCM and
//! appended to size-rotated segment files. Segments past their retention
//! window are purged by [`EncryptedStore::cleanup`]. The store also keeps
//! the in-memory buffer of discoveries awaiting submission to the control
//! plane, guarded by the same lock as the active segment.

pub mod cipher;
pub mod config;
pub mod error;
pub mod export;
pub mod segment;
pub mod store;

pub use cipher::RecordCipher;
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use export::{ExportBlob, ExportPayload};
pub use segment::{read_segment, SegmentContents, SegmentFile};
pub use store::{read_discoveries, EncryptedStore};
