//! Local filesystem storage implementation using OpenDAL.
//!
//! Objects live under `{base_path}/{bucket_name}/{relative_path}`. Caller
//! metadata is persisted next to each object as a `{relative_path}.meta`
//! JSON sidecar, since a plain filesystem has nowhere else to keep it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use opendal::layers::LoggingLayer;
use opendal::services::Fs;
use opendal::Operator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::error::{StorageError, StorageResult};
use super::traits::{SharedStorageProvider, StorageProvider};
use super::types::{FileMetadata, Metadata, ProviderKind, StorageConfig, normalize_key};

/// Suffix of metadata sidecar files.
pub const META_SUFFIX: &str = ".meta";

/// Directory holding health-check sentinels.
const HEALTH_CHECK_PREFIX: &str = ".health_check";

/// Content type reported when the caller supplied none.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Local filesystem storage provider.
///
/// Uses OpenDAL for all filesystem operations, providing a consistent
/// interface with the object store backends.
pub struct LocalStorageProvider {
    config: StorageConfig,
    root: PathBuf,
    operator: Operator,
}

impl LocalStorageProvider {
    /// Create a provider, creating `{base_path}/{bucket_name}` if needed.
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        config.validate_provider_config()?;

        let base = config
            .local_base_path
            .clone()
            .ok_or_else(|| StorageError::config("Local storage requires local_base_path"))?;
        let root = std::path::absolute(base.join(&config.bucket_name))
            .map_err(|e| StorageError::backend_with_source("local", "connect", e))?;

        async_fs::create_dir_all(&root).await.map_err(|e| {
            StorageError::backend(
                "local",
                "connect",
                format!("Failed to create {}: {}", root.display(), e),
            )
        })?;

        let operator = Self::build_operator(&root)?;
        tracing::debug!("Local storage ready at {}", root.display());

        Ok(Self {
            config,
            root,
            operator,
        })
    }

    /// Create a shared provider.
    pub async fn shared(config: StorageConfig) -> StorageResult<SharedStorageProvider> {
        Ok(Arc::new(Self::new(config).await?))
    }

    /// Directory objects are written under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the OpenDAL operator.
    fn build_operator(root: &Path) -> StorageResult<Operator> {
        let root = root
            .to_str()
            .ok_or_else(|| StorageError::config("Invalid path encoding"))?;

        let builder = Fs::default().root(root);
        let op = Operator::new(builder)
            .map_err(|e| StorageError::from_opendal("local", "connect", root, e))?
            .layer(LoggingLayer::default())
            .finish();

        Ok(op)
    }

    fn sidecar_key(key: &str) -> String {
        format!("{key}{META_SUFFIX}")
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn err(&self, operation: &str, path: &str, e: opendal::Error) -> StorageError {
        StorageError::from_opendal(self.name(), operation, path, e)
    }

    #[cfg(unix)]
    async fn set_file_permissions(&self, key: &str) -> StorageResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.full_path(key);
        async_fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|e| StorageError::backend_with_source(self.name(), "upload", e))
    }

    #[cfg(not(unix))]
    async fn set_file_permissions(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn is_dir(&self, key: &str) -> bool {
        async_fs::metadata(self.full_path(key))
            .await
            .is_ok_and(|m| m.is_dir())
    }

    async fn read_sidecar(&self, key: &str) -> Metadata {
        let sidecar = Self::sidecar_key(key);
        match self.operator.read(&sidecar).await {
            Ok(buf) => serde_json::from_slice(&buf.to_vec()).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable metadata sidecar {}: {}", sidecar, e);
                Metadata::new()
            }),
            Err(_) => Metadata::new(),
        }
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
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
        if key.ends_with(META_SUFFIX) {
            return Err(StorageError::InvalidPath(format!(
                "'{key}' collides with the metadata sidecar naming"
            )));
        }
        let storage_path = self.storage_path(&key)?.to_string();
        let size = content.len();

        self.operator
            .write(&key, content)
            .await
            .map_err(|e| self.err("upload", &storage_path, e))?;
        self.set_file_permissions(&key).await?;

        let sidecar = Self::sidecar_key(&key);
        match metadata.filter(|m| !m.is_empty()) {
            Some(metadata) => {
                let encoded = serde_json::to_vec(metadata).map_err(|e| {
                    StorageError::backend_with_source(self.name(), "upload", e)
                })?;
                self.operator
                    .write(&sidecar, encoded)
                    .await
                    .map_err(|e| self.err("upload", &storage_path, e))?;
                self.set_file_permissions(&sidecar).await?;
            }
            None => {
                // Drop metadata left over from a previous upload of the same key.
                self.operator
                    .delete(&sidecar)
                    .await
                    .map_err(|e| self.err("upload", &storage_path, e))?;
            }
        }

        tracing::debug!("Stored {} ({} bytes)", storage_path, size);
        Ok(storage_path)
    }

    async fn download_file(&self, storage_path: &str) -> StorageResult<Bytes> {
        let key = self.relative_path(storage_path)?;
        match self.operator.read(&key).await {
            Ok(data) => Ok(data.to_bytes()),
            Err(e) if e.kind() != opendal::ErrorKind::NotFound && self.is_dir(&key).await => {
                Err(StorageError::InvalidPath(format!("{storage_path} is a directory")))
            }
            Err(e) => Err(self.err("download", storage_path, e)),
        }
    }

    async fn delete_file(&self, storage_path: &str) -> StorageResult<bool> {
        let key = self.relative_path(storage_path)?;
        match self.operator.stat(&key).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.err("delete", storage_path, e)),
        }

        self.operator
            .delete(&key)
            .await
            .map_err(|e| self.err("delete", storage_path, e))?;
        self.operator
            .delete(&Self::sidecar_key(&key))
            .await
            .map_err(|e| self.err("delete", storage_path, e))?;

        tracing::debug!("Deleted {}", storage_path);
        Ok(true)
    }

    async fn file_exists(&self, storage_path: &str) -> bool {
        let Ok(key) = self.relative_path(storage_path) else {
            return false;
        };
        match self.operator.stat(&key).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    async fn get_file_url(
        &self,
        storage_path: &str,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        // Local files have no presigned form; hand out a file:// URL instead.
        let key = self.relative_path(storage_path)?;
        if !self.file_exists(storage_path).await {
            return Err(StorageError::not_found(self.name(), "get_url", storage_path));
        }
        let url = url::Url::from_file_path(self.full_path(&key)).map_err(|_| {
            StorageError::InvalidPath(format!("cannot build a file URL for '{storage_path}'"))
        })?;
        Ok(url.to_string())
    }

    async fn get_file_metadata(&self, storage_path: &str) -> StorageResult<FileMetadata> {
        let key = self.relative_path(storage_path)?;
        let meta = self
            .operator
            .stat(&key)
            .await
            .map_err(|e| self.err("get_metadata", storage_path, e))?;
        if !meta.is_file() {
            return Err(StorageError::not_found(self.name(), "get_metadata", storage_path));
        }

        let created = async_fs::metadata(self.full_path(&key))
            .await
            .ok()
            .and_then(|m| m.created().ok())
            .map(DateTime::<Utc>::from);
        let custom = self.read_sidecar(&key).await;
        let content_type = custom
            .get("content_type")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        Ok(FileMetadata {
            size: meta.content_length(),
            modified: meta.last_modified(),
            created,
            etag: None,
            content_type: Some(content_type),
            provider: self.name().to_string(),
            storage_path: storage_path.to_string(),
            custom,
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
            if key.is_empty()
                || key.ends_with('/')
                || key.ends_with(META_SUFFIX)
                || key.starts_with(HEALTH_CHECK_PREFIX)
            {
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
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Local storage health check read back different content");
                false
            }
            Err(e) => {
                tracing::warn!("Local storage health check failed: {}", e);
                false
            }
        }
    }

    async fn ping(&self) -> bool {
        self.operator.check().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn provider(dir: &Path) -> LocalStorageProvider {
        LocalStorageProvider::new(StorageConfig::local("docs", dir))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let path = storage
            .upload_file("documents/f1", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();
        assert_eq!(path, "local://docs/documents/f1");
        assert!(dir.path().join("docs/documents/f1").is_file());
        assert_eq!(storage.download_file(&path).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_written_files_are_0644() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        storage
            .upload_file("a.txt", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("docs/a.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_metadata_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let mut metadata = Metadata::new();
        metadata.insert("content_type".into(), json!("text/plain"));
        metadata.insert("tags".into(), json!(["a", "b"]));

        let path = storage
            .upload_file("notes/a.txt", Bytes::from_static(b"hello"), Some(&metadata))
            .await
            .unwrap();

        let sidecar = std::fs::read(dir.path().join("docs/notes/a.txt.meta")).unwrap();
        let stored: Metadata = serde_json::from_slice(&sidecar).unwrap();
        assert_eq!(stored, metadata);

        let info = storage.get_file_metadata(&path).await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));
        assert_eq!(info.provider, "local");
        assert_eq!(info.storage_path, path);
        assert_eq!(info.custom.get("tags"), Some(&json!(["a", "b"])));
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let path = storage
            .upload_file("a.txt", Bytes::from_static(b"x"), Some(&Metadata::from([(
                "k".to_string(),
                json!(1),
            )])))
            .await
            .unwrap();
        assert!(storage.file_exists(&path).await);

        assert!(storage.delete_file(&path).await.unwrap());
        assert!(!storage.file_exists(&path).await);
        assert!(!dir.path().join("docs/a.txt.meta").exists());
        assert!(!storage.delete_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_surfaces_io_failures() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let path = storage
            .upload_file("sub/a", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        // The parent turns into a regular file, so stat fails with ENOTDIR.
        std::fs::remove_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/sub"), b"not a directory").unwrap();

        let err = storage.delete_file(&path).await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_directory_download_is_invalid_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        storage
            .upload_file("documents/inner/a", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        let err = storage
            .download_file("local://docs/documents/inner")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        assert!(!err.is_transient());
        assert!(!storage.delete_file("local://docs/documents/inner").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let err = storage.download_file("local://docs/missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = storage.get_file_metadata("local://docs/missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!storage.file_exists("local://docs/missing").await);
    }

    #[tokio::test]
    async fn test_foreign_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;

        assert!(matches!(
            storage.download_file("s3://docs/a").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            storage.download_file("local://other/a").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(!storage.file_exists("not a path").await);
    }

    #[tokio::test]
    async fn test_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let path = storage
            .upload_file("a.txt", Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        let url = storage
            .get_file_url(&path, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/docs/a.txt"));
    }

    #[tokio::test]
    async fn test_list_files_hides_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let metadata = Metadata::from([("k".to_string(), json!("v"))]);
        storage
            .upload_file("documents/a", Bytes::from_static(b"1"), Some(&metadata))
            .await
            .unwrap();
        storage
            .upload_file("documents/b", Bytes::from_static(b"2"), None)
            .await
            .unwrap();
        storage
            .upload_file("other/c", Bytes::from_static(b"3"), None)
            .await
            .unwrap();

        let listed = storage.list_files("documents").await.unwrap();
        assert_eq!(
            listed,
            vec!["local://docs/documents/a", "local://docs/documents/b"]
        );
        assert_eq!(storage.list_files("").await.unwrap().len(), 3);
        assert!(storage.list_files("nothing-here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_check_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        assert!(storage.health_check().await);
        assert!(storage.ping().await);
        assert!(storage.list_files("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_sidecar_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = provider(dir.path()).await;
        assert!(storage
            .upload_file("a.meta", Bytes::from_static(b"x"), None)
            .await
            .is_err());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        /// Relative keys of one to four `[a-z0-9_-]` segments.
        fn arb_key() -> impl Strategy<Value = String> {
            proptest::collection::vec("[a-z0-9_-]{1,8}", 1..4).prop_map(|parts| parts.join("/"))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Whatever is uploaded under a key downloads byte for byte.
            #[test]
            fn upload_download_round_trip(
                key in arb_key(),
                content in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let dir = tempfile::tempdir().unwrap();
                    let storage = provider(dir.path()).await;

                    let path = storage
                        .upload_file(&key, Bytes::from(content.clone()), None)
                        .await
                        .unwrap();
                    prop_assert_eq!(&path, &format!("local://docs/{key}"));
                    prop_assert!(storage.file_exists(&path).await);
                    prop_assert_eq!(storage.download_file(&path).await.unwrap(), Bytes::from(content));

                    prop_assert!(storage.delete_file(&path).await.unwrap());
                    prop_assert!(!storage.file_exists(&path).await);
                    Ok(())
                })?;
            }
        }
    }
}
