//! Attachment store: blob bytes in a [`BlobStore`], metadata in the catalog
//! [`Store`].

mod blob;

pub use blob::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore, sha256_hex};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Attachment, timestamp_now};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "message")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Still referenced as a version package.
    Conflict(String),
    Failed(String),
}

/// Splits a comma-separated id list, dropping blanks and duplicates.
pub fn parse_id_list(ids: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|existing| existing == id) {
            out.push(id.to_string());
        }
    }
    out
}

pub struct AttachmentStore {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
}

impl AttachmentStore {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    pub async fn put(
        &self,
        name: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<Attachment> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("attachment name must not be empty"));
        }

        let digest = sha256_hex(data);
        self.blobs.put(&digest, data).await?;

        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            content_type: content_type.map(str::to_string),
            size: data.len() as i64,
            digest,
            created_at: timestamp_now(),
        };
        self.store.create_attachment(&attachment)?;

        tracing::debug!(
            id = %attachment.id,
            size = attachment.size,
            digest = %attachment.digest,
            "attachment stored"
        );
        Ok(attachment)
    }

    pub fn describe(&self, id: &str) -> Result<Attachment> {
        self.store
            .get_attachment(id)?
            .ok_or_else(|| Error::not_found(format!("attachment {id}")))
    }

    pub async fn get(&self, id: &str) -> Result<(Vec<u8>, Attachment)> {
        let attachment = self.describe(id)?;
        let data = self.blobs.get(&attachment.digest).await.map_err(|e| match e {
            BlobError::NotFound => {
                tracing::error!(id, digest = %attachment.digest, "attachment blob missing");
                Error::Internal(format!("blob for attachment {id} is missing"))
            }
            other => other.into(),
        })?;
        Ok((data, attachment))
    }

    /// Deletes each id independently; one failure does not stop the rest.
    pub async fn delete_many(&self, ids: &[String]) -> BTreeMap<String, DeleteOutcome> {
        let mut outcomes = BTreeMap::new();
        for id in ids {
            let outcome = match self.delete_one(id).await {
                Ok(true) => DeleteOutcome::Deleted,
                Ok(false) => DeleteOutcome::NotFound,
                Err(Error::Conflict(message)) => DeleteOutcome::Conflict(message),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "attachment delete failed");
                    DeleteOutcome::Failed(e.to_string())
                }
            };
            outcomes.insert(id.clone(), outcome);
        }
        outcomes
    }

    async fn delete_one(&self, id: &str) -> Result<bool> {
        let Some(attachment) = self.store.get_attachment(id)? else {
            return Ok(false);
        };
        if !self.store.delete_attachment(id)? {
            return Ok(false);
        }
        if self.store.count_attachments_with_digest(&attachment.digest)? == 0 {
            self.blobs.delete(&attachment.digest).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn attachments() -> (AttachmentStore, Arc<MemoryBlobStore>) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        (
            AttachmentStore::new(Arc::new(store), blobs.clone()),
            blobs,
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (attachments, _) = attachments();
        let stored = attachments
            .put("chart.tgz", Some("application/gzip"), b"bytes")
            .await
            .unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(stored.digest, sha256_hex(b"bytes"));

        let (data, meta) = attachments.get(&stored.id).await.unwrap();
        assert_eq!(data, b"bytes");
        assert_eq!(meta, stored);

        assert!(matches!(
            attachments.get("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_many_reports_each_id() {
        let (attachments, blobs) = attachments();
        let a = attachments.put("a", None, b"same").await.unwrap();
        let b = attachments.put("b", None, b"same").await.unwrap();
        assert_eq!(blobs.len(), 1);

        let ids = vec![a.id.clone(), "ghost".to_string()];
        let outcomes = attachments.delete_many(&ids).await;
        assert_eq!(outcomes[&a.id], DeleteOutcome::Deleted);
        assert_eq!(outcomes["ghost"], DeleteOutcome::NotFound);
        // Blob is still referenced by b.
        assert_eq!(blobs.len(), 1);

        let outcomes = attachments.delete_many(&[b.id.clone()]).await;
        assert_eq!(outcomes[&b.id], DeleteOutcome::Deleted);
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(" a, b,,a ,c"), vec!["a", "b", "c"]);
        assert!(parse_id_list("").is_empty());
    }
}
