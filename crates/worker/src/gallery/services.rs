//! Collaborators used by the gallery activities
//!
//! Activities never reach for a global application handle: each one is
//! constructed with exactly the services it needs. The traits here are the
//! seams; in-memory implementations back the tests and a filesystem
//! implementation backs the worker binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Errors reported by collaborators
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Gallery record as stored by the upload layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub id: String,
    pub name: String,
    /// Blob keys of the gallery's images, in upload order
    pub images: Vec<String>,
    #[serde(default)]
    pub processed_count: Option<usize>,
}

/// Outbound email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

// =============================================================================
// Traits
// =============================================================================

/// Record storage for galleries
#[async_trait]
pub trait GalleryRepository: Send + Sync + 'static {
    async fn find_gallery(&self, gallery_id: &str) -> Result<Option<Gallery>, ServiceError>;

    /// Record how many images were processed; idempotent
    async fn mark_processed(&self, gallery_id: &str, count: usize) -> Result<(), ServiceError>;
}

/// Binary storage for uploaded and derived files
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError>;

    /// Write `data` under `key`, replacing any previous content
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), ServiceError>;
}

/// Outbound notification dispatch
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Send `message` at most once per `idempotency_key`
    ///
    /// Returns the provider message id; a repeated key returns the id of the
    /// original send.
    async fn send(&self, idempotency_key: &str, message: EmailMessage)
        -> Result<String, ServiceError>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryGalleryRepository {
    galleries: RwLock<HashMap<String, Gallery>>,
}

impl InMemoryGalleryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, gallery: Gallery) {
        self.galleries.write().insert(gallery.id.clone(), gallery);
    }

    pub fn get(&self, gallery_id: &str) -> Option<Gallery> {
        self.galleries.read().get(gallery_id).cloned()
    }
}

#[async_trait]
impl GalleryRepository for InMemoryGalleryRepository {
    async fn find_gallery(&self, gallery_id: &str) -> Result<Option<Gallery>, ServiceError> {
        Ok(self.get(gallery_id))
    }

    async fn mark_processed(&self, gallery_id: &str, count: usize) -> Result<(), ServiceError> {
        let mut galleries = self.galleries.write();
        let gallery = galleries
            .get_mut(gallery_id)
            .ok_or_else(|| ServiceError::NotFound(gallery_id.to_string()))?;
        gallery.processed_count = Some(count);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), ServiceError> {
        self.blobs.write().insert(key.to_string(), data);
        Ok(())
    }
}

/// Mailer that keeps sent messages in memory, deduplicated by key
#[derive(Debug, Default)]
pub struct InMemoryMailer {
    sent: RwLock<Vec<(String, EmailMessage)>>,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.read().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl Mailer for InMemoryMailer {
    async fn send(
        &self,
        idempotency_key: &str,
        message: EmailMessage,
    ) -> Result<String, ServiceError> {
        let mut sent = self.sent.write();
        if !sent.iter().any(|(key, _)| key == idempotency_key) {
            sent.push((idempotency_key.to_string(), message));
        }
        Ok(format!("msg-{idempotency_key}"))
    }
}

// =============================================================================
// Filesystem implementations
// =============================================================================

/// Blob storage rooted at a directory
///
/// Keys are relative paths; `..` components are rejected.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf, ServiceError> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ServiceError::NotFound(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        match tokio::fs::read(self.path(key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), ServiceError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!(path = %path.display(), "blob written");
        Ok(())
    }
}

/// Gallery records stored as `galleries/<id>.json` in a blob store
pub struct BlobGalleryRepository<B> {
    blobs: B,
}

impl<B: BlobStore> BlobGalleryRepository<B> {
    pub fn new(blobs: B) -> Self {
        Self { blobs }
    }

    fn key(gallery_id: &str) -> String {
        format!("galleries/{gallery_id}.json")
    }
}

#[async_trait]
impl<B: BlobStore> GalleryRepository for BlobGalleryRepository<B> {
    async fn find_gallery(&self, gallery_id: &str) -> Result<Option<Gallery>, ServiceError> {
        match self.blobs.get(&Self::key(gallery_id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn mark_processed(&self, gallery_id: &str, count: usize) -> Result<(), ServiceError> {
        let mut gallery = self
            .find_gallery(gallery_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(gallery_id.to_string()))?;
        gallery.processed_count = Some(count);
        self.blobs
            .put(&Self::key(gallery_id), serde_json::to_vec_pretty(&gallery)?)
            .await
    }
}

/// Mailer that only logs
///
/// Used when no mail provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        idempotency_key: &str,
        message: EmailMessage,
    ) -> Result<String, ServiceError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            %idempotency_key,
            "email dispatched"
        );
        Ok(idempotency_key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_mailer_deduplicates() {
        let mailer = InMemoryMailer::new();
        let message = EmailMessage {
            to: "a@b.com".into(),
            subject: "hi".into(),
            body: "body".into(),
        };

        let first = mailer.send("k1", message.clone()).await.unwrap();
        let second = mailer.send("k1", message.clone()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_processed_unknown_gallery() {
        let repo = InMemoryGalleryRepository::new();

        let result = repo.mark_processed("missing", 3).await;

        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fs_blob_store_round_trip() {
        let root = std::env::temp_dir().join(format!("photoflow-blobs-{}", uuid::Uuid::now_v7()));
        let store = FsBlobStore::new(&root);

        assert!(store.get("a/b.bin").await.unwrap().is_none());
        store.put("a/b.bin", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a/b.bin").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(store.get("../escape").await.is_err());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_blob_gallery_repository() {
        let repo = BlobGalleryRepository::new(InMemoryBlobStore::new());
        let gallery = Gallery {
            id: "g1".into(),
            name: "Trip".into(),
            images: vec!["images/1.jpg".into()],
            processed_count: None,
        };
        repo.blobs
            .put("galleries/g1.json", serde_json::to_vec(&gallery).unwrap())
            .await
            .unwrap();

        repo.mark_processed("g1", 1).await.unwrap();

        let stored = repo.find_gallery("g1").await.unwrap().unwrap();
        assert_eq!(stored.processed_count, Some(1));
        assert!(repo.find_gallery("g2").await.unwrap().is_none());
    }
}
