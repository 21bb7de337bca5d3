//! Google Cloud Storage using OpenDAL.
//!
//! GCS is not part of the factory's built-in set; register it at runtime
//! with [`register_gcs`] where it is wanted.

use futures::FutureExt;
use opendal::layers::LoggingLayer;
use opendal::services::Gcs;
use opendal::Operator;

use super::error::{StorageError, StorageResult};
use super::factory::StorageFactory;
use super::object_store::ObjectStorageProvider;
use super::traits::StorageProvider;
use super::types::{ProviderKind, StorageConfig};

/// Build the OpenDAL operator for a GCS config.
pub fn build_gcs_operator(config: &StorageConfig) -> StorageResult<Operator> {
    let mut builder = Gcs::default().bucket(&config.bucket_name);

    // Optional: service account credentials, otherwise taken from the environment
    if let Some(creds_path) = &config.gcs_credentials_path {
        let creds_path = creds_path
            .to_str()
            .ok_or_else(|| StorageError::config("Invalid credentials path"))?;
        builder = builder.credential_path(creds_path);
    }

    let op = Operator::new(builder)
        .map_err(|e| StorageError::from_opendal("gcs", "connect", &config.bucket_name, e))?
        .layer(LoggingLayer::default())
        .finish();

    Ok(op)
}

impl ObjectStorageProvider {
    /// Connect to a GCS bucket, verifying it is reachable.
    pub async fn connect_gcs(config: StorageConfig) -> StorageResult<Self> {
        config.validate_provider_config()?;
        let operator = build_gcs_operator(&config)?;
        let provider = Self::from_operator(ProviderKind::Gcs, config, operator);
        provider.ensure_bucket().await?;

        tracing::info!("Connected to GCS bucket {}", provider.bucket());
        Ok(provider)
    }
}

/// Register the GCS backend under the `gcs` provider name.
pub async fn register_gcs(factory: &StorageFactory) {
    factory
        .register(ProviderKind::Gcs.as_str(), |config| {
            async move {
                let provider = ObjectStorageProvider::connect_gcs(config).await?;
                Ok::<_, StorageError>(provider.into_shared())
            }
            .boxed()
        })
        .await;
}
