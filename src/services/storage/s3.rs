//! S3-compatible storage using OpenDAL.
//!
//! Covers Amazon S3 and S3-compatible services:
//! - MinIO
//! - Cloudflare R2
//! - DigitalOcean Spaces

use opendal::layers::LoggingLayer;
use opendal::services::S3;
use opendal::Operator;

use super::error::{StorageError, StorageResult};
use super::object_store::ObjectStorageProvider;
use super::traits::StorageProvider;
use super::types::{ProviderKind, StorageConfig};

/// Build the OpenDAL operator for an S3-compatible config.
pub fn build_s3_operator(config: &StorageConfig) -> StorageResult<Operator> {
    let access_key = config
        .access_key
        .as_deref()
        .ok_or_else(|| StorageError::config("S3-compatible storage requires access_key"))?;
    let secret_key = config
        .secret_key
        .as_deref()
        .ok_or_else(|| StorageError::config("S3-compatible storage requires secret_key"))?;

    let mut builder = S3::default()
        .bucket(&config.bucket_name)
        .region(&config.region)
        .access_key_id(access_key)
        .secret_access_key(secret_key)
        // Credentials come from the config only, never from ~/.aws or IMDS.
        .disable_config_load()
        .disable_ec2_metadata();

    // Custom endpoint for S3-compatible services
    if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        builder = builder.endpoint(&config.endpoint_url(endpoint)?);
    }

    let op = Operator::new(builder)
        .map_err(|e| StorageError::from_opendal("s3", "connect", &config.bucket_name, e))?
        .layer(LoggingLayer::default())
        .finish();

    Ok(op)
}

impl ObjectStorageProvider {
    /// Connect to an S3-compatible bucket, verifying it is reachable.
    pub async fn connect_s3(config: StorageConfig) -> StorageResult<Self> {
        config.validate_provider_config()?;
        let operator = build_s3_operator(&config)?;
        let provider = Self::from_operator(ProviderKind::S3, config, operator);
        provider.ensure_bucket().await?;

        tracing::info!("Connected to S3-compatible bucket {}", provider.bucket());
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_operator_for_minio() {
        let config = StorageConfig::s3(
            "docs",
            Some("localhost:9000".to_string()),
            "minioadmin",
            "minioadmin",
            false,
        );
        let op = build_s3_operator(&config).unwrap();
        assert_eq!(op.info().scheme(), opendal::Scheme::S3);
    }

    #[test]
    fn test_build_operator_requires_credentials() {
        let mut config = StorageConfig::s3("docs", None, "key", "secret", true);
        config.secret_key = None;
        assert!(matches!(
            build_s3_operator(&config),
            Err(StorageError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_validates_before_network() {
        let config = StorageConfig::s3("bad/bucket", None, "key", "secret", true);
        assert!(matches!(
            ObjectStorageProvider::connect_s3(config).await,
            Err(StorageError::Configuration(_))
        ));
    }
}
