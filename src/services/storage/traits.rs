//! Storage provider traits.
//!
//! This module defines the core contract every storage backend implements,
//! providing a unified interface for object operations across providers.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::error::{StorageError, StorageResult};
use super::types::{FileMetadata, Metadata, ProviderKind, StorageConfig, StoragePath, normalize_key};

/// Core trait for storage providers.
///
/// Storage paths handed out by [`upload_file`](StorageProvider::upload_file)
/// always carry the provider's scheme and bucket (`local://docs/a/b`,
/// `s3://docs/a/b`) and are the only identifier accepted by the other
/// operations.
///
/// # Example
///
/// ```ignore
/// use assistant_storage::services::storage::{StorageConfig, StorageFactory};
///
/// let factory = StorageFactory::with_builtin();
/// let provider = factory.create_provider(&StorageConfig::local("docs", "/tmp/x")).await?;
///
/// let path = provider.upload_file("notes/a.txt", "hello".into(), None).await?;
/// assert_eq!(path, "local://docs/notes/a.txt");
/// let data = provider.download_file(&path).await?;
/// ```
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// The provider kind.
    fn kind(&self) -> ProviderKind;

    /// The configuration this provider was built from.
    fn config(&self) -> &StorageConfig;

    /// Registry name, used in errors and logs.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Bucket this provider writes into.
    fn bucket(&self) -> &str {
        &self.config().bucket_name
    }

    /// Build the canonical storage path for a relative key.
    fn storage_path(&self, relative: &str) -> StorageResult<StoragePath> {
        StoragePath::new(self.kind().scheme(), self.bucket(), relative)
    }

    /// Resolve a storage path to its key, rejecting paths owned by another
    /// provider or bucket.
    fn relative_path(&self, storage_path: &str) -> StorageResult<String> {
        let parsed = StoragePath::parse(storage_path)?;
        if parsed.scheme() != self.kind().scheme() || parsed.bucket() != self.bucket() {
            return Err(StorageError::InvalidPath(format!(
                "'{storage_path}' does not belong to {}://{}",
                self.kind().scheme(),
                self.bucket()
            )));
        }
        normalize_key(parsed.key())
    }

    /// Store `content` under `path` and return the storage path.
    ///
    /// Intermediate directories or key prefixes are created as needed.
    async fn upload_file(
        &self,
        path: &str,
        content: Bytes,
        metadata: Option<&Metadata>,
    ) -> StorageResult<String>;

    /// Read the full contents of an object.
    ///
    /// Fails with [`StorageError::NotFound`] if the object does not exist.
    async fn download_file(&self, storage_path: &str) -> StorageResult<Bytes>;

    /// Delete an object. Returns `false` if it was already absent.
    async fn delete_file(&self, storage_path: &str) -> StorageResult<bool>;

    /// Check whether an object exists. Any failure reads as "does not exist".
    async fn file_exists(&self, storage_path: &str) -> bool;

    /// URL for direct access: a `file://` URL for local storage, a presigned
    /// URL valid for `expires_in` for object stores.
    async fn get_file_url(&self, storage_path: &str, expires_in: Duration)
    -> StorageResult<String>;

    /// Get size, timestamps, content type and custom metadata.
    async fn get_file_metadata(&self, storage_path: &str) -> StorageResult<FileMetadata>;

    /// List storage paths of every object under `prefix`.
    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Write, read back and delete a sentinel object.
    async fn health_check(&self) -> bool;

    /// Cheap liveness probe used by the connection pool.
    async fn ping(&self) -> bool;

    /// Release backend resources. The default does nothing.
    async fn close(&self) {}
}

/// A shared provider for dynamic dispatch.
pub type SharedStorageProvider = Arc<dyn StorageProvider>;
