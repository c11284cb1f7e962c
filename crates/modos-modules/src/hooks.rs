//! Module code boundary.
//!
//! Module logic is linked in at build time: a [`ModuleFactoryRegistry`] maps a
//! manifest name to a constructor producing [`ModuleHooks`]. A module without
//! a factory runs with [`NoopHooks`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modos_events::EventBus;
use modos_protocol::{
    CanonicalResponse, EndpointDefinition, EventPayload, Module, ModuleHealth, RegisterEndpoints,
    RuntimeError, RuntimeResult, names,
};
use parking_lot::RwLock;

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// What a module sees while starting and stopping.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub module: Module,
    pub bus: EventBus,
}

impl ModuleContext {
    pub fn new(module: Module, bus: EventBus) -> Self {
        Self { module, bus }
    }

    /// Publish this module's routes and wait for the server to accept them.
    pub async fn register_endpoints(&self, endpoints: Vec<EndpointDefinition>) -> RuntimeResult<()> {
        let payload = EventPayload::RegisterEndpoints(RegisterEndpoints {
            module_id: self.module.name.clone(),
            endpoints,
        });
        let reply = self
            .bus
            .emit_and_wait(
                names::REGISTER_ENDPOINTS,
                payload,
                DEFAULT_REGISTRATION_TIMEOUT,
            )
            .await?;
        match reply {
            EventPayload::Response(CanonicalResponse::Error { error }) => {
                Err(RuntimeError::ModuleStartFailure {
                    module: self.module.name.to_string(),
                    reason: error.message,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.module.config.get(key).and_then(|value| value.as_str())
    }
}

/// Start, stop, and health hooks of one module. All hooks are optional.
#[async_trait]
pub trait ModuleHooks: Send + Sync {
    async fn start(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health(&self, _context: &ModuleContext) -> ModuleHealth {
        ModuleHealth::healthy("no health check implemented")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl ModuleHooks for NoopHooks {}

pub type ModuleFactory =
    Arc<dyn Fn(&Module) -> anyhow::Result<Arc<dyn ModuleHooks>> + Send + Sync + 'static>;

/// Name to constructor table for linked-in modules.
#[derive(Clone, Default)]
pub struct ModuleFactoryRegistry {
    factories: Arc<RwLock<BTreeMap<String, ModuleFactory>>>,
}

impl std::fmt::Debug for ModuleFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFactoryRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ModuleFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Module) -> anyhow::Result<Arc<dyn ModuleHooks>> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Build hooks for `module`, falling back to [`NoopHooks`].
    pub fn instantiate(&self, module: &Module) -> anyhow::Result<Arc<dyn ModuleHooks>> {
        let factory = self.factories.read().get(module.name.as_str()).cloned();
        match factory {
            Some(factory) => (*factory)(module),
            None => Ok(Arc::new(NoopHooks)),
        }
    }
}
