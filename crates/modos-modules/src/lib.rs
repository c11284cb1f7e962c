//! # modos-modules — module discovery and lifecycle
//!
//! - [`scanner`] — walks module directories and parses `module.yaml`
//! - [`registry`] — the single owner of module records and their audit log
//! - [`resolver`] — dependency-first start order
//! - [`hooks`] — the code boundary: [`ModuleHooks`] and the factory table
//! - [`lifecycle`] — start/stop/health orchestration over the registry

pub mod hooks;
pub mod lifecycle;
pub mod registry;
pub mod resolver;
pub mod scanner;

pub use hooks::{ModuleContext, ModuleFactory, ModuleFactoryRegistry, ModuleHooks, NoopHooks};
pub use lifecycle::LifecycleOrchestrator;
pub use registry::ModuleRegistry;
pub use resolver::{resolve_closure, resolve_order};
pub use scanner::{ModuleScanner, ScanReport, SkippedModule};
