use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

type Service = Arc<dyn Any + Send + Sync>;

/// Named, typed handles to long-lived collaborators.
///
/// Replaces process-wide singletons: the server registers what it owns here
/// and in-process modules look services up by name and type.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<BTreeMap<String, Service>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `name`, replacing any previous entry.
    pub fn register<T>(&self, name: impl Into<String>, service: Arc<T>) -> bool
    where
        T: Any + Send + Sync,
    {
        let name = name.into();
        let replaced = self.services.write().insert(name.clone(), service).is_some();
        debug!(service = %name, replaced, "service registered");
        replaced
    }

    /// Look up `name`; `None` when absent or registered with another type.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let service = self.services.read().get(name).cloned()?;
        service.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[test]
    fn lookup_is_typed() {
        let services = ServiceRegistry::new();
        assert!(!services.register("clock", Arc::new(Clock(7))));
        assert_eq!(services.get::<Clock>("clock").as_deref(), Some(&Clock(7)));
        assert!(services.get::<String>("clock").is_none());
        assert!(services.get::<Clock>("missing").is_none());
    }

    #[test]
    fn register_replaces_and_remove_drops() {
        let services = ServiceRegistry::new();
        services.register("clock", Arc::new(Clock(1)));
        assert!(services.register("clock", Arc::new(Clock(2))));
        assert_eq!(services.get::<Clock>("clock").map(|clock| clock.0), Some(2));
        assert!(services.remove("clock"));
        assert!(!services.contains("clock"));
        assert!(services.names().is_empty());
    }
}
