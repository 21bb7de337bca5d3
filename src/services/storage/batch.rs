//! Batched execution of storage operations.
//!
//! Callers enqueue single operations with [`BatchProcessor::add_operation`].
//! A background loop started by [`BatchProcessor::start`] polls the queue
//! and hands off a batch once `batch_size` operations are waiting, or once
//! the oldest waiting operation is older than `max_batch_wait`. Each batch is
//! split by operation kind; the partitions run concurrently and every
//! operation's callback fires exactly once with its own result after the
//! whole batch finished.

use async_lock::{Mutex, Semaphore};
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::{StorageError, StorageResult};
use super::traits::{SharedStorageProvider, StorageProvider};
use super::types::Metadata;

/// How long `stop` waits for in-flight batches.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub poll_interval: Duration,
    /// A partial batch is dispatched once its oldest operation waited this long.
    pub max_batch_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: 3,
            poll_interval: Duration::from_millis(100),
            max_batch_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperationKind {
    Upload,
    Download,
    Delete,
}

/// Successful outcome of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Storage path of the stored object.
    Uploaded(String),
    Downloaded(Bytes),
    /// Whether an object was actually removed.
    Deleted(bool),
}

/// Result of one operation, delivered to its callback.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub kind: BatchOperationKind,
    pub path: String,
    pub outcome: StorageResult<BatchOutcome>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub type BatchCallback = Box<dyn FnOnce(BatchResult) + Send + 'static>;

/// A queued storage operation.
pub struct BatchOperation {
    pub kind: BatchOperationKind,
    /// Relative path for uploads, storage path for downloads and deletes.
    pub path: String,
    pub content: Option<Bytes>,
    pub metadata: Option<Metadata>,
    pub created_at: Instant,
    callback: Option<BatchCallback>,
}

impl BatchOperation {
    fn new(kind: BatchOperationKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            content: None,
            metadata: None,
            created_at: Instant::now(),
            callback: None,
        }
    }

    pub fn upload(path: impl Into<String>, content: Bytes, metadata: Option<Metadata>) -> Self {
        Self {
            content: Some(content),
            metadata,
            ..Self::new(BatchOperationKind::Upload, path)
        }
    }

    pub fn download(storage_path: impl Into<String>) -> Self {
        Self::new(BatchOperationKind::Download, storage_path)
    }

    pub fn delete(storage_path: impl Into<String>) -> Self {
        Self::new(BatchOperationKind::Delete, storage_path)
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(BatchResult) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// Batch processor status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub running: bool,
    pub pending_operations: usize,
    pub active_batches: usize,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub batches_completed: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
}

/// Queues operations for one provider and runs them in batches.
pub struct BatchProcessor {
    provider: SharedStorageProvider,
    config: BatchConfig,
    pending: Mutex<VecDeque<BatchOperation>>,
    active_batches: AtomicUsize,
    permits: Semaphore,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    batches_completed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl BatchProcessor {
    pub fn new(provider: SharedStorageProvider, config: BatchConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_batches.max(1));
        Self {
            provider,
            config,
            pending: Mutex::new(VecDeque::new()),
            active_batches: AtomicUsize::new(0),
            permits,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            batches_completed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &SharedStorageProvider {
        &self.provider
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Queue an operation for the next batch.
    pub async fn add_operation(&self, operation: BatchOperation) {
        let mut pending = self.pending.lock().await;
        pending.push_back(operation);
        tracing::trace!("Queued batch operation ({} pending)", pending.len());
    }

    /// Spawn the polling loop. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let processor = Arc::downgrade(self);
        let poll_interval = self.config.poll_interval;
        *worker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                let Some(processor) = processor.upgrade() else {
                    break;
                };
                processor.dispatch(false).await;
            }
        }));
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!("Started batch processor for {}", self.provider.name());
    }

    /// Stop the polling loop, then run whatever is still queued.
    pub async fn stop(self: &Arc<Self>) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);

        self.flush().await;
        if !self.wait_for_completion(STOP_DRAIN_TIMEOUT).await {
            tracing::warn!(
                "Batch processor for {} stopped with batches still running",
                self.provider.name()
            );
        }
        tracing::debug!("Stopped batch processor for {}", self.provider.name());
    }

    /// Dispatch every queued operation now, including partial batches.
    pub async fn flush(self: &Arc<Self>) {
        self.dispatch(true).await;
    }

    /// Wait until nothing is queued or running. Returns `false` on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn status(&self) -> BatchStatus {
        BatchStatus {
            running: self.running.load(Ordering::SeqCst),
            pending_operations: self.pending.lock().await.len(),
            active_batches: self.active_batches.load(Ordering::SeqCst),
            batch_size: self.config.batch_size,
            max_concurrent_batches: self.config.max_concurrent_batches,
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            operations_succeeded: self.succeeded.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Run one batch to completion and fire its callbacks.
    ///
    /// Results are merged by path; when a path occurs twice the later
    /// operation's result is kept, but each callback still gets its own.
    pub async fn process_batch(&self, batch: Vec<BatchOperation>) -> HashMap<String, BatchResult> {
        let size = batch.len();
        let mut uploads = Vec::new();
        let mut downloads = Vec::new();
        let mut deletes = Vec::new();
        for operation in batch {
            match operation.kind {
                BatchOperationKind::Upload => uploads.push(operation),
                BatchOperationKind::Download => downloads.push(operation),
                BatchOperationKind::Delete => deletes.push(operation),
            }
        }

        let (uploads, downloads, deletes) = futures::join!(
            self.run_partition(uploads),
            self.run_partition(downloads),
            self.run_partition(deletes)
        );

        let mut merged = HashMap::with_capacity(size);
        let mut failures = 0;
        for (result, callback) in uploads.into_iter().chain(downloads).chain(deletes) {
            if result.is_success() {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                failures += 1;
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(callback) = callback {
                callback(result.clone());
            }
            merged.insert(result.path.clone(), result);
        }

        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Batch of {} operations on {} finished ({} failed)",
            size,
            self.provider.name(),
            failures
        );
        merged
    }

    async fn run_partition(
        &self,
        operations: Vec<BatchOperation>,
    ) -> Vec<(BatchResult, Option<BatchCallback>)> {
        join_all(operations.into_iter().map(|operation| self.run_operation(operation))).await
    }

    async fn run_operation(
        &self,
        mut operation: BatchOperation,
    ) -> (BatchResult, Option<BatchCallback>) {
        let callback = operation.callback.take();
        let outcome = match operation.kind {
            BatchOperationKind::Upload => match operation.content.take() {
                Some(content) => self
                    .provider
                    .upload_file(&operation.path, content, operation.metadata.as_ref())
                    .await
                    .map(BatchOutcome::Uploaded),
                None => Err(StorageError::config(format!(
                    "Upload of {} has no content",
                    operation.path
                ))),
            },
            BatchOperationKind::Download => self
                .provider
                .download_file(&operation.path)
                .await
                .map(BatchOutcome::Downloaded),
            BatchOperationKind::Delete => self
                .provider
                .delete_file(&operation.path)
                .await
                .map(BatchOutcome::Deleted),
        };

        if let Err(e) = &outcome {
            tracing::warn!("Batched {:?} of {} failed: {}", operation.kind, operation.path, e);
        }

        let result = BatchResult {
            kind: operation.kind,
            path: operation.path,
            outcome,
        };
        (result, callback)
    }

    /// Move ready batches off the queue into their own tasks.
    async fn dispatch(self: &Arc<Self>, force: bool) {
        let batch_size = self.config.batch_size.max(1);
        let mut pending = self.pending.lock().await;
        loop {
            let overdue = pending
                .front()
                .is_some_and(|oldest| oldest.created_at.elapsed() >= self.config.max_batch_wait);
            let ready = pending.len() >= batch_size || (!pending.is_empty() && (force || overdue));
            if !ready {
                break;
            }

            let take = pending.len().min(batch_size);
            let batch: Vec<BatchOperation> = pending.drain(..take).collect();
            // Counted while the queue is locked so waiters never observe a gap.
            self.active_batches.fetch_add(1, Ordering::SeqCst);

            let processor = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = processor.permits.acquire().await;
                processor.process_batch(batch).await;
                processor.active_batches.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn is_idle(&self) -> bool {
        let queued = self.pending.lock().await.len();
        queued == 0 && self.active_batches.load(Ordering::SeqCst) == 0
    }
}
