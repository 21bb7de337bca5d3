//! Small dependency injection container.
//!
//! Services are registered under a name with an async factory and a
//! singleton flag. Singletons are built on first resolution and cached;
//! other services are rebuilt on every resolution. Factories receive the
//! container so they can resolve their own dependencies.

use anyhow::{Context, Result, anyhow};
use async_lock::{Mutex, RwLock};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Type-erased service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type ServiceFactory =
    Arc<dyn Fn(Arc<ServiceContainer>) -> BoxFuture<'static, Result<ServiceInstance>> + Send + Sync>;

struct Registration {
    factory: ServiceFactory,
    singleton: bool,
}

pub struct ServiceContainer {
    registrations: RwLock<HashMap<String, Registration>>,
    singletons: Mutex<HashMap<String, ServiceInstance>>,
}

impl ServiceContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registrations: RwLock::new(HashMap::new()),
            singletons: Mutex::new(HashMap::new()),
        })
    }

    /// Register (or replace) a service.
    pub async fn register<T, F, Fut>(&self, name: &str, singleton: bool, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(Arc<ServiceContainer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
    {
        let factory: ServiceFactory = Arc::new(move |container| {
            factory(container)
                .map(|built| built.map(|service| service as ServiceInstance))
                .boxed()
        });

        self.registrations
            .write()
            .await
            .insert(name.to_string(), Registration { factory, singleton });
        // A replaced registration must not keep serving the old instance.
        self.singletons.lock().await.remove(name);
        tracing::debug!("Registered service {} (singleton: {})", name, singleton);
    }

    /// Register an already built value as a singleton.
    pub async fn register_instance<T>(&self, name: &str, instance: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.register(name, true, move |_| {
            let instance = Arc::clone(&instance);
            async move { Ok::<_, anyhow::Error>(instance) }
        })
        .await;
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.registrations.read().await.contains_key(name)
    }

    /// Resolve a service by name and downcast it to `T`.
    pub async fn resolve<T>(self: &Arc<Self>, name: &str) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let instance = self.resolve_any(name).await?;
        instance.downcast::<T>().map_err(|_| {
            anyhow!(
                "Service '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            )
        })
    }

    async fn resolve_any(self: &Arc<Self>, name: &str) -> Result<ServiceInstance> {
        if let Some(instance) = self.singletons.lock().await.get(name) {
            return Ok(Arc::clone(instance));
        }

        let (factory, singleton) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(name)
                .ok_or_else(|| anyhow!("Service '{}' is not registered", name))?;
            (Arc::clone(&registration.factory), registration.singleton)
        };

        // Built without holding any lock: factories resolve their dependencies.
        let instance = factory(Arc::clone(self))
            .await
            .with_context(|| format!("Failed to construct service '{name}'"))?;

        if singleton {
            // Two concurrent first resolutions may both build; the first stored wins.
            let mut singletons = self.singletons.lock().await;
            let stored = singletons
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&instance));
            return Ok(Arc::clone(stored));
        }
        Ok(instance)
    }

    /// Drop every cached singleton.
    pub async fn clear_singletons(&self) {
        self.singletons.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Settings {
        bucket: String,
    }

    #[derive(Debug)]
    struct Client {
        settings: Arc<Settings>,
        id: usize,
    }

    #[tokio::test]
    async fn test_singletons_are_cached() {
        let container = ServiceContainer::new();
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        container
            .register("settings", true, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok::<_, anyhow::Error>(Arc::new(Settings {
                        bucket: "docs".to_string(),
                    }))
                }
            })
            .await;

        let a = container.resolve::<Settings>("settings").await.unwrap();
        let b = container.resolve::<Settings>("settings").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_services_resolve_dependencies() {
        let container = ServiceContainer::new();
        container
            .register_instance(
                "settings",
                Arc::new(Settings {
                    bucket: "docs".to_string(),
                }),
            )
            .await;

        let next_id = Arc::new(AtomicUsize::new(0));
        container
            .register("client", false, move |container| {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                async move {
                    let settings = container.resolve::<Settings>("settings").await?;
                    Ok::<_, anyhow::Error>(Arc::new(Client { settings, id }))
                }
            })
            .await;

        let first = container.resolve::<Client>("client").await.unwrap();
        let second = container.resolve::<Client>("client").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(Arc::ptr_eq(&first.settings, &second.settings));
        assert_eq!(first.settings.bucket, "docs");
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let container = ServiceContainer::new();
        assert!(container.resolve::<Settings>("missing").await.is_err());

        container
            .register_instance("settings", Arc::new(Settings { bucket: "x".into() }))
            .await;
        let err = container.resolve::<Client>("settings").await.unwrap_err();
        assert!(err.to_string().contains("is not a"));

        container
            .register("broken", true, |_| async {
                Err::<Arc<Settings>, _>(anyhow!("no credentials"))
            })
            .await;
        let err = container.resolve::<Settings>("broken").await.unwrap_err();
        assert!(format!("{err:#}").contains("no credentials"));
        assert!(!container.singletons.lock().await.contains_key("broken"));
    }
}
