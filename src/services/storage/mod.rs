//! Pluggable object storage.
//!
//! This module provides a unified interface over object storage backends
//! using Apache OpenDAL, wrapped with pooling, rate limiting and batching.
//!
//! Supported storage backends:
//!
//! - **Local Filesystem** with JSON metadata sidecars
//! - **Amazon S3** and S3-compatible services (MinIO, Cloudflare R2, DigitalOcean Spaces)
//! - **Google Cloud Storage (GCS)**, registered at runtime with [`register_gcs`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StorageManager                           │
//! │  - Document operations, migration, batch upload             │
//! │  - Health check cache                                       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ RateLimiter          │ ConnectionPool       │ BatchProcessor
//!          ▼                      ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              StorageContext (per provider / connection)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StorageFactory                           │
//! │  - Registry of provider constructors                        │
//! └─────────────────────────────────────────────────────────────┘
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌──────────────────┐ ┌──────────────┐ ┌──────────────────┐
//! │   LocalFs        │ │  S3          │ │  GCS             │
//! │   (OpenDAL)      │ │  (OpenDAL)   │ │  (OpenDAL)       │
//! └──────────────────┘ └──────────────┘ └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use assistant_storage::services::storage::{StorageConfig, StorageContext, StorageManager};
//!
//! let context = Arc::new(StorageContext::default());
//! let manager = StorageManager::new(StorageConfig::local("docs", "/tmp/x"), context.clone()).await?;
//!
//! let path = manager.upload_document("f1", "hello".into(), None).await?;
//! let data = manager.download_document(&path).await?;
//! assert!(manager.delete_document(&path).await);
//!
//! context.close_all().await;
//! ```

pub mod api;
mod batch;
mod context;
mod error;
mod factory;
#[cfg(feature = "gcs")]
mod gcs;
mod local_fs;
mod locator;
mod manager;
mod object_store;
mod pool;
mod rate_limiter;
mod s3;
mod traits;
mod types;

// Re-export main types
pub use batch::{
    BatchCallback, BatchConfig, BatchOperation, BatchOperationKind, BatchOutcome,
    BatchProcessor, BatchResult, BatchStatus,
};
pub use context::StorageContext;
pub use error::{BoxError, StorageError, StorageResult};
pub use factory::{ProviderConstructor, ProviderFuture, StorageFactory};
pub use locator::{
    STORAGE_CONFIG_SERVICE, STORAGE_CONTEXT_SERVICE, STORAGE_MANAGER_SERVICE, ServiceLocator,
    register_storage_services,
};
pub use manager::{
    BatchUploadResults, CleanupResults, DocumentUpload, DocumentUploadResult, MigrationResults,
    PathError, PerformanceMetrics, StorageInfo, StorageManager,
};
pub use pool::{ConnectionMetrics, ConnectionPool, PoolConfig, PoolMetrics};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStatus};
pub use traits::{SharedStorageProvider, StorageProvider};
pub use types::{
    FileMetadata, Metadata, ProviderKind, SanitizedConfig, StorageConfig, StoragePath,
    relative_path_of,
};

// Re-export storage implementations
#[cfg(feature = "gcs")]
pub use gcs::register_gcs;
pub use local_fs::LocalStorageProvider;
pub use object_store::ObjectStorageProvider;
