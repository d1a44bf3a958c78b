//! Record sealing with AES-256-GCM.
//!
//! Every sealed record is `nonce || ciphertext`, where the 96-bit nonce is
//! freshly drawn from the OS RNG for each call and the ciphertext carries
//! the 16-byte GCM tag.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{Result, StoreError};

/// Name of the persisted key file inside the data directory.
pub const KEY_FILE: &str = "encryption.key";

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Smallest possible sealed record (empty plaintext).
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

/// Seals and opens individual records.
#[derive(Clone)]
pub struct RecordCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordCipher(..)")
    }
}

impl RecordCipher {
    /// Build a cipher from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(StoreError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let aead =
            Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        Ok(Self { aead })
    }

    /// Build a cipher from a hex-encoded key.
    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim()).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
        Self::from_key(&bytes)
    }

    /// Resolve the store key.
    ///
    /// An externally supplied hex key wins. Otherwise `encryption.key` in
    /// `dir` is loaded, or a random key is generated and written there with
    /// owner-only permissions so history stays readable across restarts.
    pub fn load_or_generate(dir: &Path, external: Option<&str>) -> Result<Self> {
        if let Some(hex_key) = external {
            tracing::debug!("Using externally supplied encryption key");
            return Self::from_hex(hex_key);
        }

        let path = dir.join(KEY_FILE);
        if path.exists() {
            let key = fs::read(&path)?;
            tracing::debug!(path = %path.display(), "Loaded encryption key");
            return Self::from_key(&key);
        }

        fs::create_dir_all(dir)?;
        let key = Aes256Gcm::generate_key(OsRng);
        write_private(&path, key.as_slice())?;
        tracing::info!(path = %path.display(), "Generated new encryption key");
        Self::from_key(key.as_slice())
    }

    /// Seal `plaintext` under a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| StoreError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a `nonce || ciphertext` record.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < MIN_SEALED_LEN {
            return Err(StoreError::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Decrypt)
    }
}

/// Write `bytes` to a new file readable only by the owner.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = private_options().open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// `create_new` + write, mode 0600 on Unix.
pub(crate) fn private_options() -> fs::OpenOptions {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}
