//! Object storage core for the assistant platform.
//!
//! - [`services::storage`]: providers, factory, pooling, rate limiting,
//!   batching and the [`StorageManager`] façade
//! - [`services::container`]: named-service dependency injection
//! - [`config`]: flat settings to [`StorageConfig`]
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod logging;
pub mod services;

pub use config::StorageSettings;
pub use services::storage::{StorageConfig, StorageContext, StorageError, StorageManager};
