use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("invalid digest format")]
    InvalidDigest,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    fn from_io(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Io(e)
        }
    }
}

impl From<BlobError> for crate::error::Error {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound => crate::error::Error::not_found("blob"),
            BlobError::DigestMismatch { .. } | BlobError::InvalidDigest => {
                crate::error::Error::validation(e.to_string())
            }
            BlobError::Io(e) => crate::error::Error::Io(e),
        }
    }
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content-addressed byte storage keyed by SHA-256 hex digest.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `digest` after verifying the digest. Putting an
    /// existing blob is a no-op.
    async fn put(&self, digest: &str, data: &[u8]) -> Result<(), BlobError>;
    async fn get(&self, digest: &str) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, digest: &str) -> Result<bool, BlobError>;
    /// Returns false when the blob was already absent.
    async fn delete(&self, digest: &str) -> Result<bool, BlobError>;
}

fn verify(digest: &str, data: &[u8]) -> Result<(), BlobError> {
    validate_digest(digest)?;
    let actual = sha256_hex(data);
    if actual != digest {
        return Err(BlobError::DigestMismatch {
            expected: digest.to_string(),
            actual,
        });
    }
    Ok(())
}

pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    fn object_path(&self, digest: &str) -> PathBuf {
        self.base_path
            .join("objects")
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(digest)
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path.join("tmp").join(Uuid::new_v4().to_string())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, digest: &str, data: &[u8]) -> Result<(), BlobError> {
        verify(digest, data)?;

        let final_path = self.object_path(digest);
        if fs::try_exists(&final_path).await? {
            return Ok(());
        }

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut temp_file = File::create(&temp_path).await?;
        temp_file.write_all(data).await?;
        temp_file.sync_all().await?;

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&temp_path, &final_path).await?;

        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Vec<u8>, BlobError> {
        validate_digest(digest)?;
        fs::read(self.object_path(digest))
            .await
            .map_err(BlobError::from_io)
    }

    async fn exists(&self, digest: &str) -> Result<bool, BlobError> {
        validate_digest(digest)?;
        Ok(fs::try_exists(self.object_path(digest)).await?)
    }

    async fn delete(&self, digest: &str) -> Result<bool, BlobError> {
        validate_digest(digest)?;
        match fs::remove_file(self.object_path(digest)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

/// In-memory blob store for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, digest: &str, data: &[u8]) -> Result<(), BlobError> {
        verify(digest, data)?;
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(digest.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Vec<u8>, BlobError> {
        validate_digest(digest)?;
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(digest)
            .cloned()
            .ok_or(BlobError::NotFound)
    }

    async fn exists(&self, digest: &str) -> Result<bool, BlobError> {
        validate_digest(digest)?;
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(digest))
    }

    async fn delete(&self, digest: &str) -> Result<bool, BlobError> {
        validate_digest(digest)?;
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(digest)
            .is_some())
    }
}

fn validate_digest(digest: &str) -> Result<(), BlobError> {
    if digest.len() != 64 {
        return Err(BlobError::InvalidDigest);
    }

    if !digest
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
    {
        return Err(BlobError::InvalidDigest);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIGEST_123: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"123"), DIGEST_123);
    }

    #[tokio::test]
    async fn test_fs_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(temp_dir.path());

        blobs.put(DIGEST_123, b"123").await.unwrap();
        // Second put of the same content is accepted.
        blobs.put(DIGEST_123, b"123").await.unwrap();

        assert!(blobs.exists(DIGEST_123).await.unwrap());
        assert_eq!(blobs.get(DIGEST_123).await.unwrap(), b"123");

        assert!(blobs.delete(DIGEST_123).await.unwrap());
        assert!(!blobs.delete(DIGEST_123).await.unwrap());
        assert!(matches!(
            blobs.get(DIGEST_123).await,
            Err(BlobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_digest_is_verified() {
        let blobs = MemoryBlobStore::new();
        let wrong = "0".repeat(64);
        assert!(matches!(
            blobs.put(&wrong, b"123").await,
            Err(BlobError::DigestMismatch { .. })
        ));
        assert!(matches!(
            blobs.exists("not-hex").await,
            Err(BlobError::InvalidDigest)
        ));
        assert!(matches!(
            blobs.exists(&DIGEST_123.to_uppercase()).await,
            Err(BlobError::InvalidDigest)
        ));
        assert!(blobs.is_empty());
    }
}
