//! Storage provider factory.
//!
//! The factory keeps a registry of provider constructors keyed by provider
//! name. It is seeded with the built-in `local` and `s3` backends; other
//! backends can be registered at runtime without touching callers.

use async_lock::RwLock;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{StorageError, StorageResult};
use super::local_fs::LocalStorageProvider;
use super::object_store::ObjectStorageProvider;
use super::traits::{SharedStorageProvider, StorageProvider};
use super::types::{ProviderKind, StorageConfig};

/// Future returned by a provider constructor.
pub type ProviderFuture = BoxFuture<'static, StorageResult<SharedStorageProvider>>;

/// A registered provider constructor.
pub type ProviderConstructor = Arc<dyn Fn(StorageConfig) -> ProviderFuture + Send + Sync>;

/// Factory for creating storage providers based on configuration.
///
/// # Example
///
/// ```ignore
/// use assistant_storage::services::storage::{StorageConfig, StorageFactory};
///
/// let factory = StorageFactory::with_builtin();
/// let provider = factory
///     .create_provider(&StorageConfig::local("docs", "/var/lib/assistant"))
///     .await?;
/// ```
pub struct StorageFactory {
    registry: RwLock<HashMap<String, ProviderConstructor>>,
}

impl Default for StorageFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl StorageFactory {
    /// Create a factory with an empty registry.
    pub fn empty() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Create a factory seeded with the built-in providers.
    pub fn with_builtin() -> Self {
        let mut registry: HashMap<String, ProviderConstructor> = HashMap::new();
        registry.insert(
            ProviderKind::Local.as_str().to_string(),
            Arc::new(|config: StorageConfig| LocalStorageProvider::shared(config).boxed()),
        );
        registry.insert(
            ProviderKind::S3.as_str().to_string(),
            Arc::new(|config: StorageConfig| {
                async move {
                    let provider = ObjectStorageProvider::connect_s3(config).await?;
                    Ok::<_, StorageError>(provider.into_shared())
                }
                .boxed()
            }),
        );

        Self {
            registry: RwLock::new(registry),
        }
    }

    /// Register (or replace) the constructor for a provider name.
    pub async fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn(StorageConfig) -> ProviderFuture + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().await;
        if registry.insert(name.to_string(), Arc::new(constructor)).is_some() {
            tracing::debug!("Replaced storage provider registration: {}", name);
        } else {
            tracing::debug!("Registered storage provider: {}", name);
        }
    }

    /// Check if a provider name has a registered constructor.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.registry.read().await.contains_key(name)
    }

    /// Get the sorted list of registered provider names.
    pub async fn available_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate the configuration and construct its provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - The configuration is invalid for its provider
    /// - No constructor is registered for `config.provider`
    ///
    /// Backend errors raised while connecting are passed through.
    pub async fn create_provider(&self, config: &StorageConfig) -> StorageResult<SharedStorageProvider> {
        config.validate_provider_config()?;

        let name = config.provider.as_str();
        let constructor = self.registry.read().await.get(name).cloned();
        let Some(constructor) = constructor else {
            let available = self.available_providers().await.join(", ");
            return Err(StorageError::config(format!(
                "Unsupported storage provider '{name}'. Available providers: {available}"
            )));
        };

        let provider = constructor(config.clone()).await?;
        tracing::info!(
            "Created {} storage provider for bucket {}",
            name,
            config.bucket_name
        );
        Ok(provider)
    }

    /// Construct the provider and run its health check, without failing.
    pub async fn test_provider(&self, config: &StorageConfig) -> bool {
        match self.create_provider(config).await {
            Ok(provider) => {
                let healthy = provider.health_check().await;
                provider.close().await;
                healthy
            }
            Err(e) => {
                tracing::warn!("Storage provider test failed: {}", e);
                false
            }
        }
    }
}
