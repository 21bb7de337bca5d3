//! Framework-agnostic storage endpoints.
//!
//! Each handler returns an [`ApiResponse`] (HTTP status plus JSON body) so
//! any web layer can mount them:
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /storage/health` | [`StorageApi::health`] |
//! | `GET /storage/info` | [`StorageApi::info`] |
//! | `GET /storage/providers` | [`StorageApi::providers`] |
//! | `POST /storage/test` | [`StorageApi::test_config`] |
//! | `GET /storage/config` | [`StorageApi::config`] |
//! | `POST /storage/migrate` | [`StorageApi::migrate`] |
//! | `POST /storage/cleanup` | [`StorageApi::cleanup`] |

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use super::error::StorageError;
use super::locator::ServiceLocator;
use super::types::StorageConfig;

/// Status code and JSON body of a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Error response keeping the storage error's message.
    pub fn from_error(err: &StorageError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({ "success": false, "error": err.to_string() }),
        }
    }

    fn bad_request(err: &anyhow::Error) -> Self {
        Self {
            status: 400,
            body: json!({ "success": false, "error": format!("{err:#}") }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrateRequest {
    pub source_config: StorageConfig,
    pub target_config: StorageConfig,
    pub document_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupRequest {
    pub valid_storage_paths: Vec<String>,
}

fn parse_body<T: DeserializeOwned>(body: Value, what: &str) -> anyhow::Result<T> {
    serde_json::from_value(body).with_context(|| format!("Invalid {what} request body"))
}

pub struct StorageApi {
    locator: Arc<ServiceLocator>,
}

impl StorageApi {
    pub fn new(locator: Arc<ServiceLocator>) -> Self {
        Self { locator }
    }

    /// `{healthy, provider, message}`; 503 when unhealthy.
    pub async fn health(&self) -> ApiResponse {
        let provider = self.locator.default_config().provider.to_string();
        let manager = match self.locator.get_storage_manager(None).await {
            Ok(manager) => manager,
            Err(e) => {
                return ApiResponse {
                    status: 503,
                    body: json!({ "healthy": false, "provider": provider, "message": e.to_string() }),
                };
            }
        };

        let healthy = manager.health_check(false).await;
        let message = if healthy {
            "Storage is healthy"
        } else {
            "Storage health check failed"
        };
        ApiResponse {
            status: if healthy { 200 } else { 503 },
            body: json!({ "healthy": healthy, "provider": provider, "message": message }),
        }
    }

    /// `{success, data}` with storage statistics.
    pub async fn info(&self) -> ApiResponse {
        let result = async {
            let manager = self.locator.get_storage_manager(None).await?;
            manager.get_storage_info().await
        }
        .await;

        match result {
            Ok(info) => ApiResponse::ok(json!({ "success": true, "data": info })),
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    /// `{success, providers, current_provider}`.
    pub async fn providers(&self) -> ApiResponse {
        let providers = self.locator.context().factory().available_providers().await;
        ApiResponse::ok(json!({
            "success": true,
            "providers": providers,
            "current_provider": self.locator.default_config().provider,
        }))
    }

    /// Validate a posted configuration and try it against its backend.
    pub async fn test_config(&self, body: Value) -> ApiResponse {
        let config: StorageConfig = match parse_body(body, "storage config") {
            Ok(config) => config,
            Err(e) => return ApiResponse::bad_request(&e),
        };

        if let Err(e) = config.validate_provider_config() {
            return ApiResponse::ok(json!({ "success": true, "valid": false, "error": e.to_string() }));
        }

        let valid = self.locator.context().factory().test_provider(&config).await;
        let body = if valid {
            json!({ "success": true, "valid": true, "message": "Storage configuration is valid" })
        } else {
            json!({
                "success": true,
                "valid": false,
                "error": format!("Could not connect to {} storage", config.provider),
            })
        };
        ApiResponse::ok(body)
    }

    /// Current configuration without secrets.
    pub async fn config(&self) -> ApiResponse {
        ApiResponse::ok(json!(self.locator.default_config().sanitized()))
    }

    pub async fn migrate(&self, body: Value) -> ApiResponse {
        let request: MigrateRequest = match parse_body(body, "migration") {
            Ok(request) => request,
            Err(e) => return ApiResponse::bad_request(&e),
        };

        let result = async move {
            let manager = self.locator.get_storage_manager(None).await?;
            manager
                .migrate_storage(
                    request.source_config,
                    request.target_config,
                    &request.document_paths,
                )
                .await
        }
        .await;

        match result {
            Ok(results) => ApiResponse::ok(json!({ "success": true, "migration_results": results })),
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    pub async fn cleanup(&self, body: Value) -> ApiResponse {
        let request: CleanupRequest = match parse_body(body, "cleanup") {
            Ok(request) => request,
            Err(e) => return ApiResponse::bad_request(&e),
        };

        match self.locator.get_storage_manager(None).await {
            Ok(manager) => {
                let results = manager
                    .cleanup_orphaned_files(&request.valid_storage_paths)
                    .await;
                ApiResponse::ok(json!({ "success": true, "cleanup_results": results }))
            }
            Err(e) => ApiResponse::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::context::StorageContext;
    use bytes::Bytes;

    fn api(dir: &tempfile::TempDir) -> StorageApi {
        let mut config = StorageConfig::local("docs", dir.path());
        config.access_key = Some("unused".to_string());
        config.secret_key = Some("hidden".to_string());
        let locator = ServiceLocator::new(Arc::new(StorageContext::default()), config);
        StorageApi::new(Arc::new(locator))
    }

    #[tokio::test]
    async fn test_health_and_providers() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(&dir);

        let health = api.health().await;
        assert_eq!(health.status, 200);
        assert_eq!(health.body["healthy"], json!(true));
        assert_eq!(health.body["provider"], json!("local"));

        let providers = api.providers().await;
        assert_eq!(providers.body["providers"], json!(["local", "s3"]));
        assert_eq!(providers.body["current_provider"], json!("local"));
    }

    #[tokio::test]
    async fn test_config_hides_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let response = api(&dir).config().await;

        let text = response.body.to_string();
        assert!(!text.contains("hidden"));
        assert_eq!(response.body["bucket_name"], json!("docs"));
        assert_eq!(response.body["has_credentials"], json!(true));
    }

    #[tokio::test]
    async fn test_config_endpoint_validation() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(&dir);

        let malformed = api.test_config(json!({ "provider": "ftp" })).await;
        assert_eq!(malformed.status, 400);

        let invalid = api
            .test_config(json!({ "provider": "s3", "bucket_name": "docs" }))
            .await;
        assert_eq!(invalid.body["valid"], json!(false));
        assert!(invalid.body["error"].as_str().unwrap().contains("access_key"));

        let valid = api
            .test_config(json!({
                "provider": "local",
                "bucket_name": "other",
                "local_base_path": dir.path(),
            }))
            .await;
        assert_eq!(valid.body["valid"], json!(true));
    }

    #[tokio::test]
    async fn test_migrate_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let api = api(&dir);

        let manager = api.locator.get_storage_manager(None).await.unwrap();
        let kept = manager
            .upload_document("kept", Bytes::from_static(b"k"), None)
            .await
            .unwrap();
        manager
            .upload_document("stale", Bytes::from_static(b"s"), None)
            .await
            .unwrap();

        let migrated = api
            .migrate(json!({
                "source_config": { "provider": "local", "bucket_name": "docs", "local_base_path": dir.path() },
                "target_config": { "provider": "local", "bucket_name": "docs", "local_base_path": target.path() },
                "document_paths": [kept.clone(), "local://docs/documents/gone"],
            }))
            .await;
        assert_eq!(migrated.status, 200);
        assert_eq!(migrated.body["migration_results"]["successful"], json!(1));
        assert_eq!(migrated.body["migration_results"]["failed"], json!(1));

        let cleaned = api.cleanup(json!({ "valid_storage_paths": [kept] })).await;
        assert_eq!(cleaned.body["cleanup_results"]["deleted"], json!(1));

        let info = api.info().await;
        assert_eq!(info.body["data"]["total_files"], json!(1));
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found = ApiResponse::from_error(&StorageError::not_found("local", "download", "x"));
        assert_eq!(not_found.status, 404);
        let config = ApiResponse::from_error(&StorageError::config("bad bucket"));
        assert_eq!(config.status, 400);
        assert!(config.body["error"].as_str().unwrap().contains("bad bucket"));
    }
}
