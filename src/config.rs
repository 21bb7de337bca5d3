//! Flat storage settings.
//!
//! The application exposes storage configuration as flat named settings
//! (usually environment variables). [`StorageSettings`] collects them and
//! turns them into a validated [`StorageConfig`].
//!
//! | Setting | Default |
//! |---|---|
//! | `STORAGE_PROVIDER` | `local` |
//! | `STORAGE_BUCKET_NAME` | `documents` |
//! | `LOCAL_STORAGE_PATH` | `{local data dir}/assistant/storage` |
//! | `MINIO_ENDPOINT`, `MINIO_ACCESS_KEY`, `MINIO_SECRET_KEY` | unset |
//! | `MINIO_SECURE` | `false` |
//! | `MINIO_REGION` | `us-east-1` |
//! | `GCS_CREDENTIALS_PATH`, `AZURE_ACCOUNT_NAME`, `AZURE_ACCOUNT_KEY` | unset |
//! | `STORAGE_CHUNK_SIZE`, `STORAGE_MAX_CONCURRENT_UPLOADS` | provider defaults |
//! | `STORAGE_TIMEOUT`, `STORAGE_MAX_RETRIES` | `30`, `3` |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::services::storage::{ProviderKind, StorageConfig};

pub const DEFAULT_BUCKET_NAME: &str = "documents";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub storage_provider: Option<String>,
    pub storage_bucket_name: Option<String>,
    pub local_storage_path: Option<PathBuf>,
    pub minio_endpoint: Option<String>,
    pub minio_access_key: Option<String>,
    pub minio_secret_key: Option<String>,
    pub minio_secure: bool,
    pub minio_region: Option<String>,
    pub gcs_credentials_path: Option<PathBuf>,
    pub azure_account_name: Option<String>,
    pub azure_account_key: Option<String>,
    pub storage_chunk_size: Option<usize>,
    pub storage_max_concurrent_uploads: Option<usize>,
    pub storage_timeout: Option<u64>,
    pub storage_max_retries: Option<u32>,
}

impl StorageSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars())
    }

    /// Read settings from any key/value source. Empty values count as unset.
    pub fn from_map<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let text = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        Ok(Self {
            storage_provider: text("STORAGE_PROVIDER"),
            storage_bucket_name: text("STORAGE_BUCKET_NAME"),
            local_storage_path: text("LOCAL_STORAGE_PATH").map(PathBuf::from),
            minio_endpoint: text("MINIO_ENDPOINT"),
            minio_access_key: text("MINIO_ACCESS_KEY"),
            minio_secret_key: text("MINIO_SECRET_KEY"),
            minio_secure: parse_flag(&vars, "MINIO_SECURE")?.unwrap_or(false),
            minio_region: text("MINIO_REGION"),
            gcs_credentials_path: text("GCS_CREDENTIALS_PATH").map(PathBuf::from),
            azure_account_name: text("AZURE_ACCOUNT_NAME"),
            azure_account_key: text("AZURE_ACCOUNT_KEY"),
            storage_chunk_size: parse_number(&vars, "STORAGE_CHUNK_SIZE")?,
            storage_max_concurrent_uploads: parse_number(&vars, "STORAGE_MAX_CONCURRENT_UPLOADS")?,
            storage_timeout: parse_number(&vars, "STORAGE_TIMEOUT")?,
            storage_max_retries: parse_number(&vars, "STORAGE_MAX_RETRIES")?,
        })
    }

    /// Build and validate the storage configuration.
    pub fn to_storage_config(&self) -> Result<StorageConfig> {
        let provider = match self.storage_provider.as_deref() {
            Some(name) => ProviderKind::from_str(name).context("Invalid STORAGE_PROVIDER")?,
            None => ProviderKind::Local,
        };
        let bucket = self
            .storage_bucket_name
            .clone()
            .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string());

        let mut config = StorageConfig::new(provider, bucket);
        match provider {
            ProviderKind::Local => {
                config.local_base_path = Some(
                    self.local_storage_path
                        .clone()
                        .unwrap_or_else(default_local_storage_path),
                );
            }
            ProviderKind::S3 => {
                config.endpoint = self.minio_endpoint.clone();
                config.access_key = self.minio_access_key.clone();
                config.secret_key = self.minio_secret_key.clone();
                config.secure = self.minio_secure;
                if let Some(region) = &self.minio_region {
                    config.region = region.clone();
                }
            }
            ProviderKind::Gcs => {
                config.gcs_credentials_path = self.gcs_credentials_path.clone();
            }
            ProviderKind::Azure => {
                config.azure_account_name = self.azure_account_name.clone();
                config.azure_account_key = self.azure_account_key.clone();
            }
        }

        if let Some(chunk_size) = self.storage_chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(uploads) = self.storage_max_concurrent_uploads {
            config.max_concurrent_uploads = uploads;
        }
        if let Some(timeout) = self.storage_timeout {
            config.timeout = timeout;
        }
        if let Some(retries) = self.storage_max_retries {
            config.max_retries = retries;
        }

        config
            .validate_provider_config()
            .with_context(|| format!("Invalid {provider} storage settings"))?;
        Ok(config)
    }
}

/// `{local data dir}/assistant/storage`, or `./storage` without a data dir.
pub fn default_local_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("assistant").join("storage"))
        .unwrap_or_else(|| PathBuf::from("storage"))
}

fn parse_flag(vars: &HashMap<String, String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = vars.get(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => anyhow::bail!("{key} must be a boolean, got '{other}'"),
    }
}

fn parse_number<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    vars.get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a number, got '{raw}'"))
        })
        .transpose()
}
