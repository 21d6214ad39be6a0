//! Proof file storage.
//!
//! The engine stores only an opaque reference per proof. `FsBlobStore` keeps
//! files in a directory and issues expiring download URLs signed with a
//! server-side key; the HTTP side that serves those URLs is out of scope.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use teamflow_core::now_ms;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob reference: {0}")]
    InvalidReference(String),
}

/// A download link that stops verifying after `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at_ms: u64,
}

pub trait BlobStore: Send + Sync {
    /// Store bytes and return a new reference.
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;

    /// Issue a time-limited URL for `reference`.
    fn url(&self, reference: &str, ttl: Duration) -> Result<SignedUrl, BlobError>;

    /// Remove a blob. Deleting a missing blob is not an error.
    fn delete(&self, reference: &str) -> Result<(), BlobError>;
}

pub struct FsBlobStore {
    dir: PathBuf,
    base_url: String,
    signing_key: Vec<u8>,
}

impl FsBlobStore {
    pub fn open(dir: &Path, base_url: &str, signing_key: &[u8]) -> Result<Self, BlobError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.to_vec(),
        })
    }

    /// References are UUIDs we minted; anything else could escape `dir`.
    fn path_for(&self, reference: &str) -> Result<PathBuf, BlobError> {
        uuid::Uuid::parse_str(reference)
            .map_err(|_| BlobError::InvalidReference(reference.to_string()))?;
        Ok(self.dir.join(reference))
    }

    fn signature(&self, reference: &str, expires_at_ms: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.signing_key);
        hasher.update([0u8]);
        hasher.update(reference.as_bytes());
        hasher.update([0u8]);
        hasher.update(expires_at_ms.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check a signature produced by [`BlobStore::url`].
    pub fn verify(&self, reference: &str, expires_at_ms: u64, signature: &str, at_ms: u64) -> bool {
        at_ms <= expires_at_ms && self.signature(reference, expires_at_ms) == signature
    }

    pub fn read(&self, reference: &str) -> Result<Vec<u8>, BlobError> {
        Ok(std::fs::read(self.path_for(reference)?)?)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let reference = uuid::Uuid::new_v4().to_string();
        std::fs::write(self.path_for(&reference)?, bytes)?;
        tracing::debug!(reference = %reference, size = bytes.len(), "blob stored");
        Ok(reference)
    }

    fn url(&self, reference: &str, ttl: Duration) -> Result<SignedUrl, BlobError> {
        self.path_for(reference)?;
        let expires_at_ms = now_ms().saturating_add(ttl.as_millis() as u64);
        let sig = self.signature(reference, expires_at_ms);
        Ok(SignedUrl {
            url: format!(
                "{}/{reference}?expires={expires_at_ms}&sig={sig}",
                self.base_url
            ),
            expires_at_ms,
        })
    }

    fn delete(&self, reference: &str) -> Result<(), BlobError> {
        match std::fs::remove_file(self.path_for(reference)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
