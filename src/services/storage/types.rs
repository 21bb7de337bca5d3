//! Storage types and configuration.
//!
//! This module defines the provider kinds, the validated `StorageConfig`
//! record, the canonical `StoragePath` identifier and object metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::{StorageError, StorageResult};

/// Arbitrary caller-supplied metadata attached to a stored object.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Characters that may never appear in a bucket name.
const RESERVED_BUCKET_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum bucket name length.
pub const MAX_BUCKET_NAME_LEN: usize = 63;

/// Supported storage provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local filesystem tree
    Local,
    /// Amazon S3 and S3-compatible services (MinIO, R2, DigitalOcean Spaces)
    #[serde(alias = "minio")]
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
}

impl ProviderKind {
    /// Registry name for this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::S3 => "s3",
            ProviderKind::Gcs => "gcs",
            ProviderKind::Azure => "azure",
        }
    }

    /// URI scheme used in storage paths.
    pub fn scheme(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::S3 => "s3",
            ProviderKind::Gcs => "gs",
            ProviderKind::Azure => "azure",
        }
    }

    /// Get the display name for this provider.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Local => "Local Filesystem",
            ProviderKind::S3 => "S3-Compatible Object Storage",
            ProviderKind::Gcs => "Google Cloud Storage",
            ProviderKind::Azure => "Azure Blob Storage",
        }
    }

    /// Get all provider kinds.
    pub fn all() -> Vec<ProviderKind> {
        vec![
            ProviderKind::Local,
            ProviderKind::S3,
            ProviderKind::Gcs,
            ProviderKind::Azure,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "s3" | "minio" => Ok(ProviderKind::S3),
            "gcs" => Ok(ProviderKind::Gcs),
            "azure" => Ok(ProviderKind::Azure),
            other => Err(StorageError::config(format!("Unknown storage provider: {other}"))),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

fn default_max_concurrent_uploads() -> usize {
    10
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// Configuration for one logical storage target.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which provider backs this target.
    pub provider: ProviderKind,
    /// Bucket (or top-level directory for the local provider).
    pub bucket_name: String,

    /// Root directory for the local provider.
    #[serde(default)]
    pub local_base_path: Option<PathBuf>,

    /// Object store endpoint (leave empty for AWS, set for MinIO/R2/etc.)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Object store access key.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Object store secret key.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Object store region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Use TLS when the endpoint has no scheme.
    #[serde(default)]
    pub secure: bool,

    /// Service account credentials JSON path for GCS.
    #[serde(default)]
    pub gcs_credentials_path: Option<PathBuf>,
    /// Azure storage account name.
    #[serde(default)]
    pub azure_account_name: Option<String>,
    /// Azure storage account key.
    #[serde(default)]
    pub azure_account_key: Option<String>,

    /// Preferred transfer chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on concurrently running uploads.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// Per-operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("provider", &self.provider)
            .field("bucket_name", &self.bucket_name)
            .field("local_base_path", &self.local_base_path)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl StorageConfig {
    /// Create a configuration with default tunables and no credentials.
    pub fn new(provider: ProviderKind, bucket_name: impl Into<String>) -> Self {
        Self {
            provider,
            bucket_name: bucket_name.into(),
            local_base_path: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: default_region(),
            secure: false,
            gcs_credentials_path: None,
            azure_account_name: None,
            azure_account_key: None,
            chunk_size: default_chunk_size(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }

    /// Create a local filesystem configuration.
    pub fn local(bucket_name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(ProviderKind::Local, bucket_name);
        config.local_base_path = Some(base_path.into());
        config
    }

    /// Create an S3-compatible configuration.
    pub fn s3(
        bucket_name: impl Into<String>,
        endpoint: Option<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        secure: bool,
    ) -> Self {
        let mut config = Self::new(ProviderKind::S3, bucket_name);
        config.endpoint = endpoint;
        config.access_key = Some(access_key.into());
        config.secret_key = Some(secret_key.into());
        config.secure = secure;
        config
    }

    /// Validate the common fields and the fields required by the selected provider.
    pub fn validate_provider_config(&self) -> StorageResult<()> {
        validate_bucket_name(&self.bucket_name)?;

        if !(1..=300).contains(&self.timeout) {
            return Err(StorageError::config(format!(
                "timeout must be between 1 and 300 seconds, got {}",
                self.timeout
            )));
        }
        if self.max_retries > 10 {
            return Err(StorageError::config(format!(
                "max_retries must be between 0 and 10, got {}",
                self.max_retries
            )));
        }
        if self.chunk_size == 0 {
            return Err(StorageError::config("chunk_size must be positive"));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(StorageError::config("max_concurrent_uploads must be positive"));
        }

        match self.provider {
            ProviderKind::Local => {
                let empty = self
                    .local_base_path
                    .as_ref()
                    .map(|p| p.as_os_str().is_empty())
                    .unwrap_or(true);
                if empty {
                    return Err(StorageError::config(
                        "Local storage requires local_base_path",
                    ));
                }
            }
            ProviderKind::S3 => {
                if is_blank(&self.access_key) || is_blank(&self.secret_key) {
                    return Err(StorageError::config(
                        "S3-compatible storage requires access_key and secret_key",
                    ));
                }
                if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
                    self.endpoint_url(endpoint)?;
                }
            }
            ProviderKind::Gcs => {}
            ProviderKind::Azure => {
                if is_blank(&self.azure_account_name) || is_blank(&self.azure_account_key) {
                    return Err(StorageError::config(
                        "Azure storage requires azure_account_name and azure_account_key",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Resolve the endpoint into a full URL, applying the `secure` flag when
    /// the endpoint is given as a bare `host:port`.
    pub fn endpoint_url(&self, endpoint: &str) -> StorageResult<String> {
        let candidate = if endpoint.contains("://") {
            endpoint.to_string()
        } else if self.secure {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        };

        url::Url::parse(&candidate)
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .map_err(|e| StorageError::config(format!("Invalid endpoint '{endpoint}': {e}")))
    }

    /// Stable key identifying the backend this config points at.
    ///
    /// Two configs for the same provider but different roots or buckets get
    /// distinct ids, so pooled handles are never shared between them.
    pub fn connection_id(&self) -> String {
        let location = match self.provider {
            ProviderKind::Local => self
                .local_base_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            ProviderKind::S3 => self.endpoint.clone().unwrap_or_else(|| "aws".to_string()),
            ProviderKind::Gcs => "gcs".to_string(),
            ProviderKind::Azure => self.azure_account_name.clone().unwrap_or_default(),
        };
        format!("{}:{}:{}", self.provider, location, self.bucket_name)
    }

    /// Configuration view with every secret omitted.
    pub fn sanitized(&self) -> SanitizedConfig {
        SanitizedConfig {
            provider: self.provider,
            bucket_name: self.bucket_name.clone(),
            local_base_path: self.local_base_path.clone(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            secure: self.secure,
            has_credentials: !is_blank(&self.access_key)
                || !is_blank(&self.azure_account_key)
                || self.gcs_credentials_path.is_some(),
            chunk_size: self.chunk_size,
            max_concurrent_uploads: self.max_concurrent_uploads,
            timeout: self.timeout,
            max_retries: self.max_retries,
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

/// Validate a bucket name.
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    if name.trim().is_empty() {
        return Err(StorageError::config("bucket_name is required"));
    }
    if name.len() > MAX_BUCKET_NAME_LEN {
        return Err(StorageError::config(format!(
            "bucket_name must be at most {MAX_BUCKET_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_BUCKET_CHARS.contains(c)) {
        return Err(StorageError::config(format!(
            "bucket_name contains reserved character '{c}'"
        )));
    }
    Ok(())
}

/// Configuration as exposed to clients: no secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedConfig {
    pub provider: ProviderKind,
    pub bucket_name: String,
    pub local_base_path: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub region: String,
    pub secure: bool,
    pub has_credentials: bool,
    pub chunk_size: usize,
    pub max_concurrent_uploads: usize,
    pub timeout: u64,
    pub max_retries: u32,
}

/// Canonical identifier of a stored object: `{scheme}://{bucket}/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath {
    scheme: String,
    bucket: String,
    key: String,
}

impl StoragePath {
    /// Build a storage path from its parts, normalizing the key.
    pub fn new(scheme: &str, bucket: &str, key: &str) -> StorageResult<Self> {
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: normalize_key(key)?,
        })
    }

    /// Parse a `scheme://bucket/key` string.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidPath(format!("missing scheme in '{raw}'")))?;
        if scheme.is_empty() {
            return Err(StorageError::InvalidPath(format!("empty scheme in '{raw}'")));
        }
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidPath(format!("missing object key in '{raw}'")))?;
        if bucket.is_empty() {
            return Err(StorageError::InvalidPath(format!("empty bucket in '{raw}'")));
        }
        Self::new(scheme, bucket, key)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key relative to the bucket.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Strip a `scheme://bucket/` prefix if present, otherwise normalize the input.
///
/// Used when moving objects between providers, where only the relative path
/// is meaningful on the target.
pub fn relative_path_of(raw: &str) -> StorageResult<String> {
    if raw.contains("://") {
        Ok(StoragePath::parse(raw)?.key)
    } else {
        normalize_key(raw)
    }
}

/// Normalize an object key: no leading slash, no empty or parent segments.
pub fn normalize_key(key: &str) -> StorageResult<String> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(StorageError::InvalidPath("object key is empty".to_string()));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidPath(format!(
            "object key '{key}' must not contain '..'"
        )));
    }
    Ok(key.to_string())
}

/// Metadata describing a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Last modified timestamp.
    pub modified: Option<DateTime<Utc>>,
    /// Creation timestamp where the backend reports one.
    pub created: Option<DateTime<Utc>>,
    /// ETag or version identifier.
    pub etag: Option<String>,
    /// Content type / MIME type.
    pub content_type: Option<String>,
    /// Provider name.
    pub provider: String,
    /// Canonical storage path.
    pub storage_path: String,
    /// Caller-supplied metadata.
    #[serde(flatten)]
    pub custom: Metadata,
}
