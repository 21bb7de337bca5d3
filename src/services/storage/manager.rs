//! Storage manager.
//!
//! [`StorageManager`] is the façade the rest of the application talks to.
//! Each operation is first admitted by the provider's rate limiter and then
//! runs through the connection pool's retry wrapper:
//!
//! ```text
//! requested -> rate limited -> pooled execution -> success
//!                                   |
//!                                   +-> transient failure -> retry -> final failure
//! ```

use async_lock::Mutex;
use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::batch::{BatchOperation, BatchOutcome, BatchStatus};
use super::context::StorageContext;
use super::error::{StorageError, StorageResult};
use super::pool::{ConnectionPool, PoolMetrics};
use super::rate_limiter::{RateLimiter, RateLimiterStatus};
use super::traits::{SharedStorageProvider, StorageProvider};
use super::types::{FileMetadata, Metadata, SanitizedConfig, StorageConfig, relative_path_of};

/// How long a health check result is reused.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Lifetime of URLs from `get_document_url` when the caller gives none.
pub const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Namespace documents are stored under.
pub const DOCUMENTS_PREFIX: &str = "documents";

/// Outcome of moving objects between two backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationResults {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<PathError>,
}

/// A per-path failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathError {
    pub path: String,
    pub error: String,
}

/// One document for [`StorageManager::upload_documents_batch`].
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub file_id: String,
    pub content: Bytes,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchUploadResults {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<DocumentUploadResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentUploadResult {
    pub file_id: String,
    pub storage_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub provider: String,
    pub connection_pool: PoolMetrics,
    pub rate_limiter: RateLimiterStatus,
    pub batch_processor: Option<BatchStatus>,
}

/// Storage statistics for the configured bucket.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub provider: String,
    pub bucket_name: String,
    pub healthy: bool,
    pub total_files: usize,
    pub total_size: u64,
    pub config: SanitizedConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResults {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub deleted_paths: Vec<String>,
}

struct HealthStatus {
    healthy: bool,
    checked_at: Instant,
}

/// High-level document storage operations for one `StorageConfig`.
///
/// # Example
///
/// ```ignore
/// use assistant_storage::services::storage::{StorageConfig, StorageContext, StorageManager};
///
/// let context = Arc::new(StorageContext::default());
/// let manager = StorageManager::new(StorageConfig::local("docs", "/tmp/x"), context).await?;
///
/// let path = manager.upload_document("f1", "hello".into(), None).await?;
/// assert_eq!(path, "local://docs/documents/f1");
/// ```
pub struct StorageManager {
    config: StorageConfig,
    connection_id: String,
    context: Arc<StorageContext>,
    pool: Arc<ConnectionPool>,
    limiter: Arc<RateLimiter>,
    health: Mutex<Option<HealthStatus>>,
}

impl StorageManager {
    /// Build a manager and connect its provider.
    ///
    /// Invalid configurations fail here, before any operation is attempted.
    pub async fn new(config: StorageConfig, context: Arc<StorageContext>) -> StorageResult<Self> {
        config.validate_provider_config()?;

        let pool = context.connection_pool(&config).await?;
        let limiter = context.rate_limiter(config.provider.as_str()).await;
        let manager = Self {
            connection_id: config.connection_id(),
            config,
            context,
            pool,
            limiter,
            health: Mutex::new(None),
        };
        manager.provider().await?;

        tracing::info!(
            "Storage manager ready for {} bucket {}",
            manager.config.provider,
            manager.config.bucket_name
        );
        Ok(manager)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.context
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The pooled provider for this manager's configuration.
    pub async fn provider(&self) -> StorageResult<SharedStorageProvider> {
        let factory = self.context.factory();
        self.pool
            .get_connection(&self.connection_id, || factory.create_provider(&self.config))
            .await
    }

    /// Admit through the rate limiter, then run `operation` on the pool.
    async fn execute<T, Op, Fut>(&self, operation: Op) -> StorageResult<T>
    where
        Op: Fn(SharedStorageProvider) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let timeout = Duration::from_secs(self.config.timeout);
        if !self.limiter.wait_for_permission(timeout).await {
            return Err(StorageError::RateLimited {
                provider: self.config.provider.to_string(),
            });
        }

        let factory = self.context.factory();
        self.pool
            .execute_with_retry(
                &self.connection_id,
                || factory.create_provider(&self.config),
                operation,
            )
            .await
    }

    /// Store a document under `documents/{file_id}`.
    ///
    /// Caller metadata is merged with `uploaded_at`, `file_id` and
    /// `content_length`; the system keys win on conflict.
    pub async fn upload_document(
        &self,
        file_id: &str,
        content: Bytes,
        metadata: Option<Metadata>,
    ) -> StorageResult<String> {
        let path = format!("{DOCUMENTS_PREFIX}/{file_id}");
        let mut merged = metadata.unwrap_or_default();
        merged.extend(system_metadata(file_id, &content));

        match self.store(&path, content, merged).await {
            Ok(storage_path) => {
                tracing::info!("Uploaded document {} to {}", file_id, storage_path);
                Ok(storage_path)
            }
            Err(e) => {
                tracing::error!("Failed to upload document {}: {}", file_id, e);
                Err(e)
            }
        }
    }

    /// Upload to an explicit relative path.
    async fn store(&self, path: &str, content: Bytes, metadata: Metadata) -> StorageResult<String> {
        self.execute(|provider| {
            let content = content.clone();
            let metadata = &metadata;
            async move { provider.upload_file(path, content, Some(metadata)).await }
        })
        .await
    }

    pub async fn download_document(&self, storage_path: &str) -> StorageResult<Bytes> {
        self.execute(|provider| async move { provider.download_file(storage_path).await })
            .await
            .inspect_err(|e| tracing::error!("Failed to download {}: {}", storage_path, e))
    }

    /// Delete a document. Failures are logged and reported as `false`.
    pub async fn delete_document(&self, storage_path: &str) -> bool {
        match self
            .execute(|provider| async move { provider.delete_file(storage_path).await })
            .await
        {
            Ok(deleted) => {
                if deleted {
                    tracing::info!("Deleted {}", storage_path);
                }
                deleted
            }
            Err(e) => {
                tracing::error!("Failed to delete {}: {}", storage_path, e);
                false
            }
        }
    }

    pub async fn get_document_url(
        &self,
        storage_path: &str,
        expires_in: Option<Duration>,
    ) -> StorageResult<String> {
        let expires_in = expires_in.unwrap_or(DEFAULT_URL_EXPIRY);
        self.execute(|provider| async move { provider.get_file_url(storage_path, expires_in).await })
            .await
            .inspect_err(|e| tracing::error!("Failed to get URL for {}: {}", storage_path, e))
    }

    pub async fn get_document_metadata(&self, storage_path: &str) -> StorageResult<FileMetadata> {
        self.execute(|provider| async move { provider.get_file_metadata(storage_path).await })
            .await
            .inspect_err(|e| tracing::error!("Failed to get metadata for {}: {}", storage_path, e))
    }

    /// Check existence. A refused or failed check reads as `false`.
    pub async fn document_exists(&self, storage_path: &str) -> bool {
        self.execute(|provider| async move { Ok(provider.file_exists(storage_path).await) })
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Existence check for {} failed: {}", storage_path, e);
                false
            })
    }

    /// Run the provider health check, reusing a result younger than
    /// [`HEALTH_CHECK_INTERVAL`] unless `force` is set.
    pub async fn health_check(&self, force: bool) -> bool {
        let mut health = self.health.lock().await;
        if !force
            && let Some(status) = health.as_ref()
            && status.checked_at.elapsed() < HEALTH_CHECK_INTERVAL
        {
            return status.healthy;
        }

        let healthy = match self.provider().await {
            Ok(provider) => provider.health_check().await,
            Err(e) => {
                tracing::warn!("Health check could not reach {}: {}", self.connection_id, e);
                false
            }
        };
        if !healthy {
            tracing::warn!("Storage health check failed for {}", self.connection_id);
        }

        *health = Some(HealthStatus {
            healthy,
            checked_at: Instant::now(),
        });
        healthy
    }

    /// Copy `paths` from `from` to `to` through managers sharing this
    /// manager's context.
    pub async fn migrate_storage(
        &self,
        from: StorageConfig,
        to: StorageConfig,
        paths: &[String],
    ) -> StorageResult<MigrationResults> {
        let source = Self::new(from, Arc::clone(&self.context)).await?;
        let target = Self::new(to, Arc::clone(&self.context)).await?;
        Ok(source.migrate_to(&target, paths).await)
    }

    /// Copy `paths` from this manager's backend to `target`.
    ///
    /// Each object keeps its relative path and metadata. A failing path is
    /// recorded and the rest of the set is still migrated.
    pub async fn migrate_to(&self, target: &StorageManager, paths: &[String]) -> MigrationResults {
        let mut results = MigrationResults {
            total: paths.len(),
            ..MigrationResults::default()
        };

        for path in paths {
            match self.migrate_one(target, path).await {
                Ok(new_path) => {
                    tracing::debug!("Migrated {} to {}", path, new_path);
                    results.successful += 1;
                }
                Err(e) => {
                    tracing::warn!("Migration of {} failed: {}", path, e);
                    results.failed += 1;
                    results.errors.push(PathError {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Migration finished: {} of {} objects copied",
            results.successful,
            results.total
        );
        results
    }

    async fn migrate_one(&self, target: &StorageManager, path: &str) -> StorageResult<String> {
        let content = self.download_document(path).await?;
        let info = self.get_document_metadata(path).await?;
        let relative = relative_path_of(path)?;

        let mut metadata = info.custom;
        if let Some(content_type) = info.content_type {
            metadata
                .entry("content_type".to_string())
                .or_insert_with(|| json!(content_type));
        }
        target.store(&relative, content, metadata).await
    }

    /// Upload many documents through the batch processor and wait for them.
    pub async fn upload_documents_batch(
        &self,
        documents: Vec<DocumentUpload>,
    ) -> StorageResult<BatchUploadResults> {
        let processor = self.context.batch_processor(&self.config).await?;

        let mut receivers = Vec::with_capacity(documents.len());
        for document in documents {
            let mut metadata = document.metadata.unwrap_or_default();
            metadata.extend(system_metadata(&document.file_id, &document.content));

            let (tx, rx) = oneshot::channel();
            let operation = BatchOperation::upload(
                format!("{DOCUMENTS_PREFIX}/{}", document.file_id),
                document.content,
                Some(metadata),
            )
            .with_callback(move |result| {
                let _ = tx.send(result);
            });
            processor.add_operation(operation).await;
            receivers.push((document.file_id, rx));
        }

        processor.flush().await;
        let timeout = Duration::from_secs(self.config.timeout);
        if !processor.wait_for_completion(timeout).await {
            tracing::warn!("Batch upload still running after {:?}", timeout);
        }

        let mut results = BatchUploadResults {
            total: receivers.len(),
            ..BatchUploadResults::default()
        };
        let outcomes = join_all(receivers.into_iter().map(|(file_id, rx)| async move {
            let outcome = match rx.await {
                Ok(result) => result.outcome,
                Err(_) => Err(StorageError::backend(
                    "batch",
                    "upload",
                    "operation dropped before completion",
                )),
            };
            (file_id, outcome)
        }))
        .await;

        for (file_id, outcome) in outcomes {
            let entry = match outcome {
                Ok(BatchOutcome::Uploaded(storage_path)) => {
                    results.successful += 1;
                    DocumentUploadResult {
                        file_id,
                        storage_path: Some(storage_path),
                        error: None,
                    }
                }
                Ok(other) => {
                    results.failed += 1;
                    DocumentUploadResult {
                        file_id,
                        storage_path: None,
                        error: Some(format!("unexpected batch outcome {other:?}")),
                    }
                }
                Err(e) => {
                    results.failed += 1;
                    DocumentUploadResult {
                        file_id,
                        storage_path: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.results.push(entry);
        }

        tracing::info!(
            "Batch upload finished: {} succeeded, {} failed",
            results.successful,
            results.failed
        );
        Ok(results)
    }

    pub async fn get_performance_metrics(&self) -> PerformanceMetrics {
        let batch_processor = match self.context.existing_batch_processor(&self.config).await {
            Some(processor) => Some(processor.status().await),
            None => None,
        };

        PerformanceMetrics {
            provider: self.config.provider.to_string(),
            connection_pool: self.pool.metrics().await,
            rate_limiter: self.limiter.status().await,
            batch_processor,
        }
    }

    /// Count and size every object in the bucket.
    pub async fn get_storage_info(&self) -> StorageResult<StorageInfo> {
        let paths = self.execute(|provider| async move { provider.list_files("").await }).await?;

        let mut total_size = 0;
        for path in &paths {
            match self.get_document_metadata(path).await {
                Ok(info) => total_size += info.size,
                Err(e) => tracing::debug!("Skipping {} in storage info: {}", path, e),
            }
        }

        Ok(StorageInfo {
            provider: self.config.provider.to_string(),
            bucket_name: self.config.bucket_name.clone(),
            healthy: self.health_check(false).await,
            total_files: paths.len(),
            total_size,
            config: self.config.sanitized(),
        })
    }

    /// Delete every document not listed in `valid_paths`.
    pub async fn cleanup_orphaned_files(&self, valid_paths: &[String]) -> CleanupResults {
        let stored = match self
            .execute(|provider| async move { provider.list_files(DOCUMENTS_PREFIX).await })
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Cleanup could not list documents: {}", e);
                return CleanupResults::default();
            }
        };

        let valid: HashSet<&str> = valid_paths.iter().map(String::as_str).collect();
        let mut results = CleanupResults {
            scanned: stored.len(),
            ..CleanupResults::default()
        };
        for path in stored.into_iter().filter(|p| !valid.contains(p.as_str())) {
            if self.delete_document(&path).await {
                results.deleted += 1;
                results.deleted_paths.push(path);
            } else {
                results.failed += 1;
            }
        }

        tracing::info!(
            "Cleanup removed {} orphaned documents ({} failed)",
            results.deleted,
            results.failed
        );
        results
    }
}

fn system_metadata(file_id: &str, content: &Bytes) -> Metadata {
    Metadata::from([
        ("uploaded_at".to_string(), json!(chrono::Utc::now().to_rfc3339())),
        ("file_id".to_string(), json!(file_id)),
        ("content_length".to_string(), json!(content.len())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::batch::BatchConfig;

    async fn manager(dir: &tempfile::TempDir, bucket: &str) -> StorageManager {
        let context = Arc::new(StorageContext::default());
        StorageManager::new(StorageConfig::local(bucket, dir.path()), context)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;

        let path = manager
            .upload_document("f1", Bytes::from_static(b"hello"), Some(Metadata::new()))
            .await
            .unwrap();
        assert_eq!(path, "local://docs/documents/f1");
        assert_eq!(manager.download_document(&path).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(manager.document_exists(&path).await);

        assert!(manager.delete_document(&path).await);
        assert!(!manager.document_exists(&path).await);
        assert!(!manager.delete_document(&path).await);
    }

    #[tokio::test]
    async fn test_system_metadata_wins() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;

        let caller = Metadata::from([
            ("file_id".to_string(), json!("spoofed")),
            ("owner".to_string(), json!("alice")),
        ]);
        let path = manager
            .upload_document("f2", Bytes::from_static(b"abc"), Some(caller))
            .await
            .unwrap();

        let info = manager.get_document_metadata(&path).await.unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.custom["file_id"], json!("f2"));
        assert_eq!(info.custom["owner"], json!("alice"));
        assert_eq!(info.custom["content_length"], json!(3));
        assert!(info.custom.contains_key("uploaded_at"));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_construction() {
        let context = Arc::new(StorageContext::default());
        let result = StorageManager::new(StorageConfig::local("bad:name", "/tmp/x"), context).await;
        assert!(matches!(result, Err(StorageError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_document_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;

        let err = manager
            .download_document("local://docs/documents/none")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.get_document_url("local://docs/documents/none", None).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_download_is_attempted_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;
        manager
            .upload_document("f1", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        let err = manager.download_document("local://docs/documents").await.unwrap_err();
        assert!(!err.is_transient());

        let metrics = manager.connection_pool().metrics().await;
        let connection = &metrics.connections[&manager.config().connection_id()];
        assert_eq!(connection.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_health_check_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;
        assert!(manager.health_check(false).await);

        // Break the backend; the cached result is still served.
        std::fs::remove_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs"), b"not a directory").unwrap();
        assert!(manager.health_check(false).await);
        assert!(!manager.health_check(true).await);
    }

    #[tokio::test]
    async fn test_migration_partial_failure() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let context = Arc::new(StorageContext::default());
        let source = StorageManager::new(
            StorageConfig::local("docs", source_dir.path()),
            Arc::clone(&context),
        )
        .await
        .unwrap();

        let a = source
            .upload_document("a", Bytes::from_static(b"A"), None)
            .await
            .unwrap();
        let b = source
            .upload_document("b", Bytes::from_static(b"B"), None)
            .await
            .unwrap();
        let paths = vec![a, "local://docs/documents/missing".to_string(), b];

        let results = source
            .migrate_storage(
                StorageConfig::local("docs", source_dir.path()),
                StorageConfig::local("archive", target_dir.path()),
                &paths,
            )
            .await
            .unwrap();

        assert_eq!(results.total, 3);
        assert_eq!(results.failed, 1);
        assert_eq!(results.successful, 2);
        assert_eq!(results.errors[0].path, "local://docs/documents/missing");
        assert!(!results.errors[0].error.is_empty());

        let target = StorageManager::new(
            StorageConfig::local("archive", target_dir.path()),
            Arc::clone(&context),
        )
        .await
        .unwrap();
        let copied = target
            .download_document("local://archive/documents/a")
            .await
            .unwrap();
        assert_eq!(copied, Bytes::from_static(b"A"));
        let info = target
            .get_document_metadata("local://archive/documents/a")
            .await
            .unwrap();
        assert_eq!(info.custom["file_id"], json!("a"));
    }

    #[tokio::test]
    async fn test_batch_upload() {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(StorageContext::default().with_batch_config(BatchConfig {
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            ..BatchConfig::default()
        }));
        let manager = StorageManager::new(StorageConfig::local("docs", dir.path()), context)
            .await
            .unwrap();

        let documents = (0..5)
            .map(|i| DocumentUpload {
                file_id: format!("doc-{i}"),
                content: Bytes::from(format!("content {i}")),
                metadata: None,
            })
            .collect();
        let results = manager.upload_documents_batch(documents).await.unwrap();

        assert_eq!(results.total, 5);
        assert_eq!(results.successful, 5);
        assert_eq!(results.results[3].storage_path.as_deref(), Some("local://docs/documents/doc-3"));
        assert!(manager.document_exists("local://docs/documents/doc-4").await);

        let metrics = manager.get_performance_metrics().await;
        assert_eq!(metrics.provider, "local");
        assert!(metrics.batch_processor.is_some());
        manager.context().close_all().await;
    }

    #[tokio::test]
    async fn test_storage_info_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;

        let keep = manager
            .upload_document("keep", Bytes::from_static(b"1234"), None)
            .await
            .unwrap();
        manager
            .upload_document("orphan", Bytes::from_static(b"12"), None)
            .await
            .unwrap();

        let info = manager.get_storage_info().await.unwrap();
        assert_eq!(info.total_files, 2);
        assert_eq!(info.total_size, 6);
        assert!(info.healthy);

        let results = manager.cleanup_orphaned_files(&[keep.clone()]).await;
        assert_eq!(results.scanned, 2);
        assert_eq!(results.deleted, 1);
        assert_eq!(results.deleted_paths, vec!["local://docs/documents/orphan"]);
        assert!(manager.document_exists(&keep).await);
    }

    #[tokio::test]
    async fn test_metrics_track_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, "docs").await;
        manager
            .upload_document("m", Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        manager.document_exists("local://docs/documents/m").await;

        let metrics = manager.get_performance_metrics().await;
        let connection = &metrics.connection_pool.connections[&manager.config().connection_id()];
        assert_eq!(connection.total_requests, 2);
        assert_eq!(metrics.rate_limiter.total_admitted, 2);
        assert!(metrics.batch_processor.is_none());
    }
}
