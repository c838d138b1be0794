//! # Encryption Keys
//!
//! Keyed arrays embed a digest of their key in every metadata header so a
//! wrong key is detected at load time rather than producing garbage. The
//! digest is SHA-256 over the raw key bytes; an unencrypted object stores
//! the all-zero digest, which no real key can produce.
//!
//! Payload transformation is a filter-pipeline concern and lives outside
//! this crate; what the storage core guarantees is the key contract:
//! create-and-open round-trips under the same key succeed, any other key
//! fails with `EncryptionMismatch`.

use eyre::Result;
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub const KEY_DIGEST_LEN: usize = 32;
pub const AES_256_GCM_KEY_LEN: usize = 32;

/// An encryption key for array metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionKey {
    Unencrypted,
    Aes256Gcm([u8; AES_256_GCM_KEY_LEN]),
}

impl EncryptionKey {
    /// Builds an AES-256-GCM key from raw bytes; the length is fixed.
    pub fn aes_256_gcm(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AES_256_GCM_KEY_LEN {
            eyre::bail!(StorageError::InvalidArgument(format!(
                "AES-256-GCM key must be {AES_256_GCM_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; AES_256_GCM_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self::Aes256Gcm(key))
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::Unencrypted)
    }

    /// The digest persisted in keyed file headers.
    pub fn digest(&self) -> [u8; KEY_DIGEST_LEN] {
        match self {
            Self::Unencrypted => [0u8; KEY_DIGEST_LEN],
            Self::Aes256Gcm(key) => {
                let mut out = [0u8; KEY_DIGEST_LEN];
                out.copy_from_slice(&Sha256::digest(key));
                out
            }
        }
    }

    /// Validates a stored digest against this key.
    pub fn check_digest(&self, stored: &[u8; KEY_DIGEST_LEN], what: &str) -> Result<()> {
        if stored != &self.digest() {
            eyre::bail!(StorageError::EncryptionMismatch(format!(
                "key cannot decrypt {what}"
            )));
        }
        Ok(())
    }
}

impl Default for EncryptionKey {
    fn default() -> Self {
        Self::Unencrypted
    }
}
