//! # modos-kernel — the server core
//!
//! - [`server`] — lifecycle state machine, bus wiring, graceful and forced stop
//! - [`bridge`] — transport-free dispatch with middleware phases
//! - [`services`] — typed service lookup
//! - [`config`] — YAML server configuration

pub mod bridge;
pub mod config;
pub mod server;
pub mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use modos_modules::{ModuleFactoryRegistry, ModuleHooks};
use modos_protocol::{Module, ProtocolHandler};

pub use bridge::{BRIDGE_PROTOCOL, ModuleBridge};
pub use config::{HttpSettings, ServerConfig};
pub use server::{ProtocolSnapshot, Server, ServerSnapshot, StopOptions};
pub use services::ServiceRegistry;

#[derive(Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    factories: ModuleFactoryRegistry,
    protocols: Vec<Arc<dyn ProtocolHandler>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("factories", &self.factories.names())
            .field("protocols", &self.protocols.len())
            .finish()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.module_dirs.push(dir.into());
        self
    }

    pub fn module_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.config.module_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.config.graceful_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn module_factory<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Module) -> anyhow::Result<Arc<dyn ModuleHooks>> + Send + Sync + 'static,
    {
        self.factories.register(name, factory);
        self
    }

    pub fn factories(mut self, factories: ModuleFactoryRegistry) -> Self {
        self.factories = factories;
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn ProtocolHandler>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn build(self) -> Server {
        let server = Server::new(self.config, self.factories);
        for protocol in self.protocols {
            server.add_protocol(protocol);
        }
        server
    }
}
