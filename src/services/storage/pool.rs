//! Connection pooling for storage providers.
//!
//! The pool keeps constructed providers keyed by connection id so repeated
//! operations reuse one backend client instead of rebuilding it every call.
//!
//! # Architecture
//!
//! - `ConnectionPool`: bounded map of connection id -> pooled provider
//! - Lazy connection: providers are built by the caller's factory on first use
//! - Validation: a cached provider is pinged before reuse and rebuilt if dead
//! - LRU eviction: the least recently used entry makes room at capacity
//! - Retries: transient failures evict the handle and back off exponentially
//! - Idle cleanup: a background task drops entries unused for `max_idle_time`

use async_lock::{Mutex, RwLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::{StorageError, StorageResult};
use super::traits::{SharedStorageProvider, StorageProvider};

/// Pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Entries unused for longer than this are dropped by the cleanup task.
    pub max_idle_time: Duration,
    /// Upper bound on building one provider.
    pub connection_timeout: Duration,
    /// Total attempts `execute_with_retry` makes for transient failures.
    pub retry_attempts: u32,
    /// Base delay; attempt `n` sleeps `retry_delay * 2^n` before retrying.
    pub retry_delay: Duration,
    pub cleanup_interval: Duration,
}

impl PoolConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_connections == 0 {
            return Err(StorageError::config("max_connections must be at least 1"));
        }
        if self.retry_attempts == 0 {
            return Err(StorageError::config("retry_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Request statistics for one connection id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_ms: f64,
    pub average_response_time_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    fn record(&mut self, elapsed: Duration, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_response_time_ms += elapsed.as_secs_f64() * 1000.0;
        self.average_response_time_ms = self.total_response_time_ms / self.total_requests as f64;
        self.last_used = Some(Utc::now());
    }
}

/// Snapshot of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool: String,
    pub active_connections: usize,
    pub max_connections: usize,
    pub connections: HashMap<String, ConnectionMetrics>,
}

struct PooledConnection {
    connection: SharedStorageProvider,
    last_used: Instant,
}

/// Bounded pool of storage providers.
pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    connections: RwLock<HashMap<String, PooledConnection>>,
    metrics: RwLock<HashMap<String, ConnectionMetrics>>,
    /// One lock per id so calls on the same id run one at a time.
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            connections: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            id_locks: Mutex::new(HashMap::new()),
            cleanup_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a live connection for `id`, building one with `factory` if needed.
    ///
    /// A cached connection that fails its ping is closed and rebuilt. When
    /// the pool is full the least recently used entry is evicted.
    pub async fn get_connection<F, Fut>(
        &self,
        id: &str,
        factory: F,
    ) -> StorageResult<SharedStorageProvider>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<SharedStorageProvider>>,
    {
        let cached = self
            .connections
            .read()
            .await
            .get(id)
            .map(|entry| entry.connection.clone());

        if let Some(connection) = cached {
            if connection.ping().await {
                if let Some(entry) = self.connections.write().await.get_mut(id) {
                    entry.last_used = Instant::now();
                }
                return Ok(connection);
            }
            tracing::debug!("Pooled connection {} failed ping, rebuilding", id);
            self.evict(id).await;
        }

        let connection = tokio::time::timeout(self.config.connection_timeout, factory())
            .await
            .map_err(|_| {
                StorageError::backend(
                    &self.name,
                    "connect",
                    format!(
                        "connection {} not established within {:?}",
                        id, self.config.connection_timeout
                    ),
                )
            })??;

        let mut displaced = Vec::new();
        let mut evicted_ids = Vec::new();
        {
            let mut connections = self.connections.write().await;
            while connections.len() >= self.config.max_connections && !connections.contains_key(id)
            {
                let Some(lru) = connections
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                if let Some(entry) = connections.remove(&lru) {
                    tracing::debug!("Evicting least recently used connection {}", lru);
                    displaced.push(entry.connection);
                    evicted_ids.push(lru);
                }
            }

            let entry = PooledConnection {
                connection: connection.clone(),
                last_used: Instant::now(),
            };
            if let Some(previous) = connections.insert(id.to_string(), entry) {
                displaced.push(previous.connection);
            }
            tracing::debug!(
                "Pool {} added connection {} ({} active)",
                self.name,
                id,
                connections.len()
            );
        }

        for old in displaced {
            old.close().await;
        }
        self.release_id_locks(&evicted_ids).await;
        Ok(connection)
    }

    /// Run `operation` against the pooled connection for `id`.
    ///
    /// Transient failures close and evict the connection, then retry after
    /// `retry_delay * 2^attempt` until `retry_attempts` attempts were made;
    /// the last error is returned. Other errors are returned immediately.
    pub async fn execute_with_retry<T, F, Fut, Op, OpFut>(
        &self,
        id: &str,
        factory: F,
        operation: Op,
    ) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<SharedStorageProvider>>,
        Op: Fn(SharedStorageProvider) -> OpFut,
        OpFut: Future<Output = StorageResult<T>>,
    {
        let id_lock = self.id_lock(id).await;
        let _serialized = id_lock.lock().await;

        let attempts = self.config.retry_attempts;
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = match self.get_connection(id, &factory).await {
                Ok(connection) => operation(connection).await,
                Err(e) => Err(e),
            };
            self.record(id, started.elapsed(), result.is_ok()).await;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            self.evict(id).await;
            attempt += 1;
            if attempt >= attempts {
                tracing::error!(
                    "Operation on {} failed after {} attempts: {}",
                    id,
                    attempts,
                    err
                );
                return Err(err);
            }

            let delay = self.backoff(attempt - 1);
            tracing::warn!(
                "Attempt {}/{} on {} failed, retrying in {:?}: {}",
                attempt,
                attempts,
                id,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before the retry following failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .retry_delay
            .saturating_mul(1u32 << attempt.min(16))
    }

    /// Spawn the idle-connection cleanup task. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock().await;
        if task.is_some() {
            return;
        }

        let pool = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_idle().await;
            }
        }));
        tracing::debug!("Started cleanup task for pool {}", self.name);
    }

    /// Close every connection idle for longer than `max_idle_time`.
    pub async fn evict_idle(&self) -> usize {
        let (expired, idle): (Vec<String>, Vec<SharedStorageProvider>) = {
            let mut connections = self.connections.write().await;
            let expired: Vec<String> = connections
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() > self.config.max_idle_time)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| connections.remove(&id).map(|entry| (id, entry.connection)))
                .unzip()
        };

        for connection in &idle {
            connection.close().await;
        }
        self.release_id_locks(&expired).await;
        if !idle.is_empty() {
            tracing::debug!("Pool {} dropped {} idle connections", self.name, idle.len());
        }
        idle.len()
    }

    /// Stop the cleanup task, close every connection and reset metrics.
    pub async fn close(&self) {
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }

        let drained: Vec<PooledConnection> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.connection.close().await;
        }

        self.metrics.write().await.clear();
        self.id_locks.lock().await.clear();
        tracing::info!(
            "Closed pool {} ({} connections released)",
            self.name,
            drained.len()
        );
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of per-connection metrics.
    pub async fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            pool: self.name.clone(),
            active_connections: self.connection_count().await,
            max_connections: self.config.max_connections,
            connections: self.metrics.read().await.clone(),
        }
    }

    async fn evict(&self, id: &str) {
        let removed = self.connections.write().await.remove(id);
        if let Some(entry) = removed {
            entry.connection.close().await;
        }
    }

    async fn record(&self, id: &str, elapsed: Duration, success: bool) {
        self.metrics
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .record(elapsed, success);
    }

    /// Forget the per-id locks of evicted ids nobody is holding or waiting on.
    async fn release_id_locks(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut locks = self.id_locks.lock().await;
        for id in ids {
            if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(id);
            }
        }
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.id_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
