//! Service registry with lazy factories and scoped overrides.

use parking_lot::RwLock;
use serde::Serialize;
use std::any::{Any, type_name};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use tradelog_core::{Result, TradelogError};

type AnyService = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Result<AnyService> + Send + Sync>;

struct Binding {
    instance: Option<AnyService>,
    factory: Option<Factory>,
}

/// How a registered service is currently provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// An instance exists, registered directly or built by a factory.
    Instance,
    /// Only a factory is registered; it runs on first lookup.
    Factory,
}

/// Named, type-erased service container.
///
/// Services are stored as `Arc<T>` and handed out as clones. A factory runs
/// at most once per name: the first [`get_service`](Self::get_service) call
/// builds the instance under the write lock and later calls reuse it.
/// Factories must not call back into the registry.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ServiceRegistry::new();
/// registry.register_factory("pool", PoolConfig::default(), |config| {
///     ConnectionPool::new("trades.db", config.clone())
/// });
/// let pool: Arc<ConnectionPool> = registry.get_service("pool")?;
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Binding>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.list_services())
            .finish()
    }
}

fn downcast<T: Any + Send + Sync>(name: &str, service: AnyService) -> Result<Arc<T>> {
    service
        .downcast::<T>()
        .map_err(|_| TradelogError::ServiceTypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        })
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a ready-made instance, replacing any previous instance.
    ///
    /// A factory registered under the same name is kept but no longer runs,
    /// since an instance always takes precedence.
    pub fn register_service<T: Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) {
        let name = name.into();
        info!(service = %name, kind = type_name::<T>(), "Registered service");
        match self.services.write().entry(name) {
            Entry::Occupied(mut bound) => bound.get_mut().instance = Some(service),
            Entry::Vacant(slot) => {
                slot.insert(Binding {
                    instance: Some(service),
                    factory: None,
                });
            }
        }
    }

    /// Registers a factory that builds the service from `config` on first use.
    ///
    /// Replaces any previous factory. An instance already registered under
    /// the same name, directly or built earlier, keeps being returned.
    pub fn register_factory<T, C, F>(&self, name: impl Into<String>, config: C, factory: F)
    where
        T: Any + Send + Sync,
        C: Send + Sync + 'static,
        F: Fn(&C) -> Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: Factory = Arc::new(move || {
            let service: AnyService = Arc::new(factory(&config)?);
            Ok(service)
        });
        info!(service = %name, kind = type_name::<T>(), "Registered service factory");
        match self.services.write().entry(name) {
            Entry::Occupied(mut bound) => bound.get_mut().factory = Some(factory),
            Entry::Vacant(slot) => {
                slot.insert(Binding {
                    instance: None,
                    factory: Some(factory),
                });
            }
        }
    }

    /// Returns the service registered under `name`, building it if only a
    /// factory is registered.
    ///
    /// # Errors
    /// Returns [`TradelogError::ServiceNotFound`] for unknown names,
    /// [`TradelogError::ServiceTypeMismatch`] if the service is not a `T`, and
    /// [`TradelogError::ServiceConstruction`] if the factory fails.
    #[instrument(skip(self), fields(expected = type_name::<T>()))]
    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        {
            let services = self.services.read();
            match services.get(name) {
                None => return Err(TradelogError::ServiceNotFound(name.to_string())),
                Some(Binding {
                    instance: Some(instance),
                    ..
                }) => return downcast(name, Arc::clone(instance)),
                Some(_) => {}
            }
        }

        let mut services = self.services.write();
        let binding = services
            .get_mut(name)
            .ok_or_else(|| TradelogError::ServiceNotFound(name.to_string()))?;
        if let Some(instance) = &binding.instance {
            return downcast(name, Arc::clone(instance));
        }
        let factory = binding
            .factory
            .clone()
            .ok_or_else(|| TradelogError::ServiceNotFound(name.to_string()))?;

        let instance = factory().map_err(|e| TradelogError::ServiceConstruction {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        binding.instance = Some(Arc::clone(&instance));
        info!(service = name, "Built service from factory");
        downcast(name, instance)
    }

    /// Returns true if an instance or factory is registered under `name`.
    #[must_use]
    pub fn has_service(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Removes the binding for `name`, returning false if there was none.
    pub fn remove_service(&self, name: &str) -> bool {
        let removed = self.services.write().remove(name).is_some();
        if removed {
            info!(service = name, "Removed service");
        }
        removed
    }

    /// Removes every binding.
    pub fn clear(&self) {
        self.services.write().clear();
        debug!("Cleared service registry");
    }

    /// Returns every registered name with how it is currently provided.
    #[must_use]
    pub fn list_services(&self) -> BTreeMap<String, ServiceKind> {
        self.services
            .read()
            .iter()
            .map(|(name, binding)| {
                let kind = if binding.instance.is_some() {
                    ServiceKind::Instance
                } else {
                    ServiceKind::Factory
                };
                (name.clone(), kind)
            })
            .collect()
    }

    /// Binds `service` under `name` until the returned guard drops, then
    /// restores whatever was registered before (or removes the name).
    #[must_use = "the override is undone when the guard drops"]
    pub fn temporary_service<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        service: Arc<T>,
    ) -> TemporaryService<'_> {
        let name = name.into();
        let previous = self.services.write().insert(
            name.clone(),
            Binding {
                instance: Some(service),
                factory: None,
            },
        );
        debug!(service = %name, "Installed temporary service");
        TemporaryService {
            registry: self,
            name,
            previous,
        }
    }
}

/// Guard returned by [`ServiceRegistry::temporary_service`].
pub struct TemporaryService<'a> {
    registry: &'a ServiceRegistry,
    name: String,
    previous: Option<Binding>,
}

impl fmt::Debug for TemporaryService<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryService")
            .field("name", &self.name)
            .field("restores_previous", &self.previous.is_some())
            .finish()
    }
}

impl Drop for TemporaryService<'_> {
    fn drop(&mut self) {
        let mut services = self.registry.services.write();
        match self.previous.take() {
            Some(previous) => {
                services.insert(self.name.clone(), previous);
            }
            None => {
                services.remove(&self.name);
            }
        }
        debug!(service = %self.name, "Restored service binding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Greeter(String);

    #[test]
    fn test_register_and_get() {
        let registry = ServiceRegistry::new();
        registry.register_service("greeter", Arc::new(Greeter("hi".into())));

        let greeter: Arc<Greeter> = registry.get_service("greeter").unwrap();
        assert_eq!(greeter.0, "hi");
        assert!(registry.has_service("greeter"));
        assert_eq!(
            registry.list_services().get("greeter"),
            Some(&ServiceKind::Instance)
        );
    }

    #[test]
    fn test_unknown_and_mismatched() {
        let registry = ServiceRegistry::new();
        registry.register_service("greeter", Arc::new(Greeter("hi".into())));

        assert!(matches!(
            registry.get_service::<Greeter>("missing"),
            Err(TradelogError::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.get_service::<String>("greeter"),
            Err(TradelogError::ServiceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_factory_runs_once() {
        let registry = ServiceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register_factory("greeter", "hello".to_string(), move |greeting| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Greeter(greeting.clone()))
        });
        assert_eq!(
            registry.list_services().get("greeter"),
            Some(&ServiceKind::Factory)
        );

        let first: Arc<Greeter> = registry.get_service("greeter").unwrap();
        let second: Arc<Greeter> = registry.get_service("greeter").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.0, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.list_services().get("greeter"),
            Some(&ServiceKind::Instance)
        );
    }

    #[test]
    fn test_factory_runs_once_across_threads() {
        let registry = Arc::new(ServiceRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register_factory("slow", (), move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Greeter("slow".into()))
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_service::<Greeter>("slow").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_instance_takes_precedence_over_factory() {
        let registry = ServiceRegistry::new();
        registry.register_service("svc", Arc::new(1_i32));
        registry.register_factory("svc", (), |()| Ok(2_i32));

        assert_eq!(*registry.get_service::<i32>("svc").unwrap(), 1);
        assert_eq!(
            registry.list_services().get("svc"),
            Some(&ServiceKind::Instance)
        );
    }

    #[test]
    fn test_register_service_keeps_factory_binding() {
        let registry = ServiceRegistry::new();
        registry.register_factory("svc", (), |()| Ok(Greeter("built".into())));
        registry.register_service("svc", Arc::new(Greeter("direct".into())));
        assert_eq!(registry.get_service::<Greeter>("svc").unwrap().0, "direct");

        {
            let _guard = registry.temporary_service("svc", Arc::new(Greeter("mock".into())));
            assert_eq!(registry.get_service::<Greeter>("svc").unwrap().0, "mock");
        }
        assert_eq!(registry.get_service::<Greeter>("svc").unwrap().0, "direct");
    }

    #[test]
    fn test_factory_failure() {
        let registry = ServiceRegistry::new();
        registry.register_factory("broken", (), |()| -> Result<Greeter> {
            Err(TradelogError::Other("no backend".into()))
        });

        let err = registry.get_service::<Greeter>("broken").unwrap_err();
        assert!(matches!(err, TradelogError::ServiceConstruction { ref name, .. } if name == "broken"));
        assert_eq!(
            registry.list_services().get("broken"),
            Some(&ServiceKind::Factory)
        );
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ServiceRegistry::new();
        registry.register_service("a", Arc::new(1_u32));
        registry.register_service("b", Arc::new(2_u32));

        assert!(registry.remove_service("a"));
        assert!(!registry.remove_service("a"));
        registry.clear();
        assert!(registry.list_services().is_empty());
    }

    #[test]
    fn test_temporary_service_restores_previous() {
        let registry = ServiceRegistry::new();
        registry.register_service("greeter", Arc::new(Greeter("real".into())));

        {
            let _guard = registry.temporary_service("greeter", Arc::new(Greeter("mock".into())));
            let current: Arc<Greeter> = registry.get_service("greeter").unwrap();
            assert_eq!(current.0, "mock");
        }

        let restored: Arc<Greeter> = registry.get_service("greeter").unwrap();
        assert_eq!(restored.0, "real");
    }

    #[test]
    fn test_temporary_service_restores_factory() {
        let registry = ServiceRegistry::new();
        registry.register_factory("greeter", (), |()| Ok(Greeter("built".into())));

        {
            let _guard = registry.temporary_service("greeter", Arc::new(Greeter("mock".into())));
            assert_eq!(registry.get_service::<Greeter>("greeter").unwrap().0, "mock");
        }

        assert_eq!(
            registry.list_services().get("greeter"),
            Some(&ServiceKind::Factory)
        );
        assert_eq!(registry.get_service::<Greeter>("greeter").unwrap().0, "built");
    }

    #[test]
    fn test_temporary_service_removes_new_name() {
        let registry = ServiceRegistry::new();
        {
            let _guard = registry.temporary_service("scratch", Arc::new(7_u64));
            assert!(registry.has_service("scratch"));
        }
        assert!(!registry.has_service("scratch"));
    }
}
