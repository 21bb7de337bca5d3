//! Convenience accessors over an explicit [`StorageContext`].
//!
//! [`ServiceLocator`] resolves managers, providers, pools and batch
//! processors for a default configuration, or for an override supplied by
//! the caller (for example a request-scoped configuration). Managers are
//! cached per connection id.
//!
//! [`register_storage_services`] wires the same pieces into a
//! [`ServiceContainer`].

use anyhow::Context;
use async_lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::batch::BatchProcessor;
use super::context::StorageContext;
use super::error::StorageResult;
use super::manager::StorageManager;
use super::pool::ConnectionPool;
use super::traits::SharedStorageProvider;
use super::types::StorageConfig;
use crate::services::container::ServiceContainer;

/// Container name of the default `StorageConfig`.
pub const STORAGE_CONFIG_SERVICE: &str = "storage_config";
/// Container name of the shared `StorageContext`.
pub const STORAGE_CONTEXT_SERVICE: &str = "storage_context";
/// Container name of the default `StorageManager`.
pub const STORAGE_MANAGER_SERVICE: &str = "storage_manager";

pub struct ServiceLocator {
    context: Arc<StorageContext>,
    default_config: StorageConfig,
    managers: Mutex<HashMap<String, Arc<StorageManager>>>,
}

impl ServiceLocator {
    pub fn new(context: Arc<StorageContext>, default_config: StorageConfig) -> Self {
        Self {
            context,
            default_config,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.context
    }

    pub fn default_config(&self) -> &StorageConfig {
        &self.default_config
    }

    fn resolve<'a>(&'a self, config: Option<&'a StorageConfig>) -> &'a StorageConfig {
        config.unwrap_or(&self.default_config)
    }

    /// Manager for `config`, or for the default configuration.
    pub async fn get_storage_manager(
        &self,
        config: Option<&StorageConfig>,
    ) -> StorageResult<Arc<StorageManager>> {
        let config = self.resolve(config);
        let key = config.connection_id();

        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&key) {
            return Ok(Arc::clone(manager));
        }

        let manager = Arc::new(StorageManager::new(config.clone(), Arc::clone(&self.context)).await?);
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// The pooled provider behind [`get_storage_manager`](Self::get_storage_manager).
    pub async fn get_storage_provider(
        &self,
        config: Option<&StorageConfig>,
    ) -> StorageResult<SharedStorageProvider> {
        self.get_storage_manager(config).await?.provider().await
    }

    pub async fn get_connection_pool(
        &self,
        config: Option<&StorageConfig>,
    ) -> StorageResult<Arc<ConnectionPool>> {
        self.context.connection_pool(self.resolve(config)).await
    }

    pub async fn get_batch_manager(
        &self,
        config: Option<&StorageConfig>,
    ) -> StorageResult<Arc<BatchProcessor>> {
        self.context.batch_processor(self.resolve(config)).await
    }

    /// Forget cached managers and shut down every shared resource.
    pub async fn close_all(&self) {
        self.managers.lock().await.clear();
        self.context.close_all().await;
    }
}

/// Register the storage config, context and a singleton manager.
pub async fn register_storage_services(
    container: &ServiceContainer,
    context: Arc<StorageContext>,
    config: StorageConfig,
) {
    container
        .register_instance(STORAGE_CONFIG_SERVICE, Arc::new(config))
        .await;
    container
        .register_instance(STORAGE_CONTEXT_SERVICE, context)
        .await;
    container
        .register(STORAGE_MANAGER_SERVICE, true, |container| async move {
            let config = container
                .resolve::<StorageConfig>(STORAGE_CONFIG_SERVICE)
                .await?;
            let context = container
                .resolve::<StorageContext>(STORAGE_CONTEXT_SERVICE)
                .await?;
            let manager = StorageManager::new((*config).clone(), context)
                .await
                .with_context(|| format!("Failed to create {} storage manager", config.provider))?;
            Ok::<_, anyhow::Error>(Arc::new(manager))
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::traits::StorageProvider;

    #[tokio::test]
    async fn test_default_and_override_configs() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ServiceLocator::new(
            Arc::new(StorageContext::default()),
            StorageConfig::local("docs", dir.path()),
        );

        let default = locator.get_storage_manager(None).await.unwrap();
        let again = locator.get_storage_manager(None).await.unwrap();
        assert!(Arc::ptr_eq(&default, &again));

        let scoped = StorageConfig::local("scratch", dir.path());
        let overridden = locator.get_storage_manager(Some(&scoped)).await.unwrap();
        assert_eq!(overridden.config().bucket_name, "scratch");
        assert_eq!(locator.default_config().bucket_name, "docs");

        let provider = locator.get_storage_provider(Some(&scoped)).await.unwrap();
        assert_eq!(provider.bucket(), "scratch");

        let pool = locator.get_connection_pool(None).await.unwrap();
        assert_eq!(pool.name(), "local");
        let batch = locator.get_batch_manager(None).await.unwrap();
        assert!(batch.status().await.running);

        locator.close_all().await;
        assert!(!batch.status().await.running);
    }

    #[tokio::test]
    async fn test_invalid_override_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ServiceLocator::new(
            Arc::new(StorageContext::default()),
            StorageConfig::local("docs", dir.path()),
        );
        let bad = StorageConfig::local("", dir.path());
        assert!(locator.get_storage_manager(Some(&bad)).await.is_err());
    }

    #[tokio::test]
    async fn test_container_builds_manager() {
        let dir = tempfile::tempdir().unwrap();
        let container = ServiceContainer::new();
        register_storage_services(
            &container,
            Arc::new(StorageContext::default()),
            StorageConfig::local("docs", dir.path()),
        )
        .await;

        let manager = container
            .resolve::<StorageManager>(STORAGE_MANAGER_SERVICE)
            .await
            .unwrap();
        let path = manager
            .upload_document("f1", bytes::Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        assert_eq!(path, "local://docs/documents/f1");

        let same = container
            .resolve::<StorageManager>(STORAGE_MANAGER_SERVICE)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&manager, &same));
    }
}
