//! Object store provider shared by the S3-compatible and GCS backends.
//!
//! The backends only differ in how their OpenDAL operator is built (see
//! `s3.rs` and `gcs.rs`); everything after that goes through
//! [`ObjectStorageProvider`].

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::error::{StorageError, StorageResult};
use super::traits::{SharedStorageProvider, StorageProvider};
use super::types::{FileMetadata, Metadata, ProviderKind, StorageConfig, normalize_key};

/// Prefix holding health-check sentinel objects.
const HEALTH_CHECK_PREFIX: &str = ".health_check";

/// Object store provider backed by an OpenDAL operator.
pub struct ObjectStorageProvider {
    kind: ProviderKind,
    config: StorageConfig,
    operator: Operator,
}

impl ObjectStorageProvider {
    /// Wrap an already-built operator.
    ///
    /// No bucket check is performed; backend constructors call
    /// [`ensure_bucket`](Self::ensure_bucket) themselves.
    pub fn from_operator(kind: ProviderKind, config: StorageConfig, operator: Operator) -> Self {
        Self {
            kind,
            config,
            operator,
        }
    }

    /// Convert into a shared provider.
    pub fn into_shared(self) -> SharedStorageProvider {
        Arc::new(self)
    }

    /// Verify the bucket is reachable with the configured credentials.
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        self.operator.check().await.map_err(|e| match e.kind() {
            opendal::ErrorKind::NotFound => StorageError::config(format!(
                "Bucket '{}' does not exist on the {} backend",
                self.config.bucket_name, self.kind
            )),
            opendal::ErrorKind::PermissionDenied => StorageError::config(format!(
                "Access to bucket '{}' was denied: {}",
                self.config.bucket_name, e
            )),
            _ => StorageError::from_opendal(self.name(), "connect", &self.config.bucket_name, e),
        })
    }

    fn err(&self, operation: &str, path: &str, e: opendal::Error) -> StorageError {
        StorageError::from_opendal(self.name(), operation, path, e)
    }
}

/// Map caller metadata onto the object store's user-metadata convention.
///
/// Metadata travels as `x-amz-meta-*` style headers, whose names are
/// case-insensitive. Key bytes in `[a-z0-9]` pass through, `_` becomes `-`
/// and any other byte is written as `~xx` hex. Non-string values and strings
/// that would parse as JSON are stored JSON-encoded, other strings verbatim.
pub fn to_user_metadata(metadata: &Metadata) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| (encode_key(key), encode_value(value)))
        .collect()
}

/// Inverse of [`to_user_metadata`].
pub fn from_user_metadata(user_metadata: &HashMap<String, String>) -> Metadata {
    user_metadata
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            (decode_key(key), value)
        })
        .collect()
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' => encoded.push(byte as char),
            b'_' => encoded.push('-'),
            other => encoded.push_str(&format!("~{other:02x}")),
        }
    }
    encoded
}

fn decode_key(raw: &str) -> String {
    let raw = raw.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'-' => bytes.push(b'_'),
            b'~' => {
                let escaped = raw
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = escaped {
                    bytes.push(byte);
                    i += 3;
                    continue;
                }
                bytes.push(b'~');
            }
            other => bytes.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) if serde_json::from_str::<Value>(s).is_err() => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl StorageProvider for ObjectStorageProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn config(&self) -> &StorageConfig {
        &self.config
    }

    async fn upload_file(
        &self,
        path: &str,
        content: Bytes,
        metadata: Option<&Metadata>,
    ) -> StorageResult<String> {
        let key = normalize_key(path)?;
        let storage_path = self.storage_path(&key)?.to_string();
        let capability = self.operator.info().full_capability();

        let mut write = self.operator.write_with(&key, content);
        if let Some(metadata) = metadata {
            if capability.write_with_content_type
                && let Some(content_type) = metadata.get("content_type").and_then(Value::as_str)
            {
                write = write.content_type(content_type);
            }
            if capability.write_with_user_metadata && !metadata.is_empty() {
                write = write.user_metadata(to_user_metadata(metadata));
            } else if !metadata.is_empty() {
                tracing::debug!(
                    "{} backend does not keep user metadata, dropping {} keys",
                    self.kind,
                    metadata.len()
                );
            }
        }
        write
            .await
            .map_err(|e| self.err("upload", &storage_path, e))?;

        tracing::debug!("Uploaded {}", storage_path);
        Ok(storage_path)
    }

    async fn download_file(&self, storage_path: &str) -> StorageResult<Bytes> {
        let key = self.relative_path(storage_path)?;
        let data = self
            .operator
            .read(&key)
            .await
            .map_err(|e| self.err("download", storage_path, e))?;
        Ok(data.to_bytes())
    }

    async fn delete_file(&self, storage_path: &str) -> StorageResult<bool> {
        let key = self.relative_path(storage_path)?;
        match self.operator.stat(&key).await {
            Ok(_) => {}
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.err("delete", storage_path, e)),
        }

        self.operator
            .delete(&key)
            .await
            .map_err(|e| self.err("delete", storage_path, e))?;
        Ok(true)
    }

    async fn file_exists(&self, storage_path: &str) -> bool {
        let Ok(key) = self.relative_path(storage_path) else {
            return false;
        };
        match self.operator.stat(&key).await {
            Ok(meta) => meta.is_file(),
            Err(e) => {
                if e.kind() != opendal::ErrorKind::NotFound {
                    tracing::debug!("Existence check for {} failed: {}", storage_path, e);
                }
                false
            }
        }
    }

    async fn get_file_url(
        &self,
        storage_path: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let key = self.relative_path(storage_path)?;
        let request = self
            .operator
            .presign_read(&key, expires_in)
            .await
            .map_err(|e| self.err("get_url", storage_path, e))?;
        Ok(request.uri().to_string())
    }

    async fn get_file_metadata(&self, storage_path: &str) -> StorageResult<FileMetadata> {
        let key = self.relative_path(storage_path)?;
        let meta = self
            .operator
            .stat(&key)
            .await
            .map_err(|e| self.err("get_metadata", storage_path, e))?;

        Ok(FileMetadata {
            size: meta.content_length(),
            modified: meta.last_modified(),
            created: None,
            etag: meta.etag().map(|s| s.trim_matches('"').to_string()),
            content_type: meta.content_type().map(|s| s.to_string()),
            provider: self.name().to_string(),
            storage_path: storage_path.to_string(),
            custom: meta.user_metadata().map(from_user_metadata).unwrap_or_default(),
        })
    }

    async fn list_files(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut dir = prefix.trim_start_matches('/').to_string();
        if !dir.is_empty() && !dir.ends_with('/') {
            dir.push('/');
        }

        let entries = match self.operator.list_with(&dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.err("list", prefix, e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let key = entry.path().trim_start_matches('/');
            if key.is_empty() || key.ends_with('/') || key.starts_with(HEALTH_CHECK_PREFIX) {
                continue;
            }
            paths.push(self.storage_path(key)?.to_string());
        }
        paths.sort();
        Ok(paths)
    }

    async fn health_check(&self) -> bool {
        let key = format!("{HEALTH_CHECK_PREFIX}/{}", uuid::Uuid::new_v4());
        let probe = Bytes::from_static(b"health_check");

        let result = async {
            self.operator.write(&key, probe.clone()).await?;
            let read_back = self.operator.read(&key).await?.to_bytes();
            self.operator.delete(&key).await?;
            Ok::<bool, opendal::Error>(read_back == probe)
        }
        .await;

        match result {
            Ok(healthy) => healthy,
            Err(e) => {
                tracing::warn!("{} health check failed: {}", self.kind, e);
                false
            }
        }
    }

    async fn ping(&self) -> bool {
        self.operator.check().await.is_ok()
    }
}
