//! Shared per-provider storage resources.
//!
//! A [`StorageContext`] is built once at process start and handed to every
//! [`StorageManager`](super::manager::StorageManager). It owns the provider
//! factory plus the connection pools and rate limiters (one per provider
//! name) and the batch processors (one per connection id), so managers for
//! the same provider share them.

use async_lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::batch::{BatchConfig, BatchProcessor};
use super::error::StorageResult;
use super::factory::StorageFactory;
use super::pool::{ConnectionPool, PoolConfig};
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use super::types::StorageConfig;

pub struct StorageContext {
    factory: Arc<StorageFactory>,
    pool_config: PoolConfig,
    rate_limit: RateLimitConfig,
    batch_config: BatchConfig,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    batch_processors: Mutex<HashMap<String, Arc<BatchProcessor>>>,
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::new(Arc::new(StorageFactory::with_builtin()))
    }
}

impl StorageContext {
    pub fn new(factory: Arc<StorageFactory>) -> Self {
        Self {
            factory,
            pool_config: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batch_config: BatchConfig::default(),
            pools: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            batch_processors: Mutex::new(HashMap::new()),
        }
    }

    /// Base pool settings. Retry count and connect timeout still come from
    /// the first `StorageConfig` seen for a provider.
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = config;
        self
    }

    pub fn factory(&self) -> &Arc<StorageFactory> {
        &self.factory
    }

    /// Get (or create and start) the pool for `config`'s provider.
    pub async fn connection_pool(
        &self,
        config: &StorageConfig,
    ) -> StorageResult<Arc<ConnectionPool>> {
        let name = config.provider.as_str();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }

        let pool_config = PoolConfig {
            retry_attempts: config.max_retries + 1,
            connection_timeout: Duration::from_secs(config.timeout),
            ..self.pool_config.clone()
        };
        let pool = Arc::new(ConnectionPool::new(name, pool_config)?);
        pool.start().await;
        pools.insert(name.to_string(), Arc::clone(&pool));
        tracing::info!("Created connection pool for {} storage", name);
        Ok(pool)
    }

    /// Get (or create) the rate limiter for a provider name.
    pub async fn rate_limiter(&self, provider: &str) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        Arc::clone(
            limiters
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::new(self.rate_limit))),
        )
    }

    /// Get (or create and start) the batch processor for `config`.
    ///
    /// Processors are keyed by connection id, so two buckets of the same
    /// provider never share a queue.
    pub async fn batch_processor(&self, config: &StorageConfig) -> StorageResult<Arc<BatchProcessor>> {
        let key = config.connection_id();
        let mut processors = self.batch_processors.lock().await;
        if let Some(processor) = processors.get(&key) {
            return Ok(Arc::clone(processor));
        }

        let provider = self.factory.create_provider(config).await?;
        let processor = Arc::new(BatchProcessor::new(provider, self.batch_config.clone()));
        processor.start().await;
        processors.insert(key.clone(), Arc::clone(&processor));
        tracing::info!("Created batch processor for {}", key);
        Ok(processor)
    }

    /// The batch processor for `config`, if one was created.
    pub async fn existing_batch_processor(&self, config: &StorageConfig) -> Option<Arc<BatchProcessor>> {
        self.batch_processors
            .lock()
            .await
            .get(&config.connection_id())
            .cloned()
    }

    /// Stop every batch processor and close every pool.
    pub async fn close_all(&self) {
        let processors: Vec<_> = self.batch_processors.lock().await.drain().collect();
        for (_, processor) in &processors {
            processor.stop().await;
        }

        let pools: Vec<_> = self.pools.lock().await.drain().collect();
        for (_, pool) in &pools {
            pool.close().await;
        }

        self.limiters.lock().await.clear();
        tracing::info!(
            "Closed storage context ({} pools, {} batch processors)",
            pools.len(),
            processors.len()
        );
    }
}
