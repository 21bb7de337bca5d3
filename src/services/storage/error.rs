//! Storage error types and result alias.
//!
//! Every provider maps its backend errors onto [`StorageError`] so callers can
//! tell a missing object apart from a broken configuration or a flaky
//! backend without looking at error strings.
//!
//! # Error Kinds
//!
//! - [`StorageError::Configuration`] - invalid or incomplete `StorageConfig`, never retried
//! - [`StorageError::NotFound`] - the storage path does not exist
//! - [`StorageError::InvalidPath`] - the storage path is malformed or belongs to another provider
//! - [`StorageError::PermissionDenied`] - the backend refused access, never retried
//! - [`StorageError::Backend`] - I/O failure, retried by the connection pool when `transient`
//! - [`StorageError::RateLimited`] - the rate limiter refused admission within the timeout
//! - [`StorageError::Unsupported`] - the provider cannot perform the operation

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The storage configuration is invalid or incomplete.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested object does not exist.
    #[error("{provider} {operation}: object not found: {path}")]
    NotFound {
        /// Provider name (e.g. "local", "s3").
        provider: String,
        /// Operation that observed the missing object.
        operation: String,
        /// Storage path that was requested.
        path: String,
    },

    /// The storage path could not be parsed or does not belong to this provider.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    /// The backend refused access to the object or bucket.
    #[error("{provider} {operation}: permission denied: {path}")]
    PermissionDenied {
        provider: String,
        operation: String,
        path: String,
    },

    /// Backend or I/O failure.
    #[error("{provider} {operation} failed: {message}")]
    Backend {
        /// Provider name.
        provider: String,
        /// Operation that failed.
        operation: String,
        /// Description of the failure.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Admission was refused by the rate limiter.
    #[error("Rate limit exceeded for provider {provider}")]
    RateLimited {
        /// Provider name.
        provider: String,
    },

    /// The provider does not support the requested operation.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Operation name.
        operation: String,
    },
}

impl StorageError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a not-found error.
    pub fn not_found(provider: &str, operation: &str, path: impl Into<String>) -> Self {
        Self::NotFound {
            provider: provider.to_string(),
            operation: operation.to_string(),
            path: path.into(),
        }
    }

    /// Creates a backend error without a source.
    pub fn backend(provider: &str, operation: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            operation: operation.to_string(),
            message: message.into(),
            transient: true,
            source: None,
        }
    }

    /// Creates a backend error wrapping an underlying error.
    pub fn backend_with_source<E>(provider: &str, operation: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            provider: provider.to_string(),
            operation: operation.to_string(),
            message: source.to_string(),
            transient: true,
            source: Some(Arc::new(source)),
        }
    }

    /// Marks a backend error as not worth retrying. Other kinds are unchanged.
    pub fn permanent(self) -> Self {
        match self {
            Self::Backend {
                provider,
                operation,
                message,
                source,
                ..
            } => Self::Backend {
                provider,
                operation,
                message,
                transient: false,
                source,
            },
            other => other,
        }
    }

    /// Maps an opendal error onto the storage taxonomy.
    ///
    /// Only failures that can go away on their own (`Unexpected`,
    /// `RateLimited`, and any kind opendal marks temporary) stay transient.
    pub(crate) fn from_opendal(
        provider: &str,
        operation: &str,
        path: &str,
        err: opendal::Error,
    ) -> Self {
        use opendal::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::not_found(provider, operation, path),
            ErrorKind::Unsupported => Self::Unsupported {
                provider: provider.to_string(),
                operation: operation.to_string(),
            },
            ErrorKind::ConfigInvalid => Self::Configuration(err.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied {
                provider: provider.to_string(),
                operation: operation.to_string(),
                path: path.to_string(),
            },
            ErrorKind::IsADirectory | ErrorKind::NotADirectory => {
                Self::InvalidPath(format!("{path}: {err}"))
            }
            ErrorKind::Unexpected | ErrorKind::RateLimited => {
                Self::backend_with_source(provider, operation, err)
            }
            _ if err.is_temporary() => Self::backend_with_source(provider, operation, err),
            _ => Self::backend_with_source(provider, operation, err).permanent(),
        }
    }

    /// Returns true when retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }

    /// Returns true for the not-found kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP-equivalent status code for API layers.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) | Self::InvalidPath(_) => 400,
            Self::PermissionDenied { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::RateLimited { .. } => 429,
            Self::Unsupported { .. } => 501,
            Self::Backend { .. } => 502,
        }
    }
}
