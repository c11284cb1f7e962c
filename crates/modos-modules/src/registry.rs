//! In-memory module records and their status transitions.

use std::collections::VecDeque;

use chrono::Utc;
use indexmap::IndexMap;
use modos_events::EventBus;
use modos_protocol::{
    EventPayload, HealthStatus, Module, ModuleEvent, ModuleEventKind, ModuleHealth, ModuleId,
    ModuleStatus, RuntimeError, RuntimeResult, names,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1024;

/// Owner of all module records.
///
/// Records are only mutated through these methods. Every mutation appends a
/// [`ModuleEvent`] to a bounded audit log and publishes it as `module.<kind>`
/// after the lock is released.
pub struct ModuleRegistry {
    bus: EventBus,
    modules: RwLock<IndexMap<ModuleId, Module>>,
    events: Mutex<VecDeque<ModuleEvent>>,
    event_capacity: usize,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self::with_event_capacity(bus, DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_event_capacity(bus: EventBus, event_capacity: usize) -> Self {
        Self {
            bus,
            modules: RwLock::new(IndexMap::new()),
            events: Mutex::new(VecDeque::new()),
            event_capacity: event_capacity.max(1),
        }
    }

    fn record(&self, module_id: &ModuleId, kind: ModuleEventKind) {
        let event = ModuleEvent::new(module_id.clone(), kind);
        let name = names::module_event(event.kind.name());
        {
            let mut events = self.events.lock();
            if events.len() == self.event_capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        self.bus.emit(&name, EventPayload::Module(event));
    }

    /// Store or replace a discovered module as `installed`.
    ///
    /// A module that is currently loading, running, or stopping keeps its
    /// runtime state; only its manifest-derived fields are refreshed.
    pub fn upsert_discovered(&self, mut module: Module) -> Module {
        let module_id = module.name.clone();
        let (stored, previous) = {
            let mut modules = self.modules.write();
            match modules.get_mut(&module_id) {
                Some(existing)
                    if matches!(
                        existing.status,
                        ModuleStatus::Loading | ModuleStatus::Running | ModuleStatus::Stopping
                    ) =>
                {
                    existing.version = module.version;
                    existing.path = module.path;
                    existing.dependencies = module.dependencies;
                    existing.config = module.config;
                    existing.description = module.description;
                    existing.author = module.author;
                    existing.cli = module.cli;
                    existing.updated_at = Utc::now();
                    (existing.clone(), Some(existing.status))
                }
                existing => {
                    let previous = existing.map(|existing| existing.status);
                    module.status = ModuleStatus::Installed;
                    module.updated_at = Utc::now();
                    modules.insert(module_id.clone(), module.clone());
                    (module, previous)
                }
            }
        };

        self.record(
            &module_id,
            ModuleEventKind::Discovered {
                version: stored.version.clone(),
                path: stored.path.clone(),
            },
        );
        if previous != Some(stored.status) {
            self.record(
                &module_id,
                ModuleEventKind::StatusChanged {
                    from: previous.unwrap_or(ModuleStatus::Discovered),
                    to: stored.status,
                },
            );
        }
        debug!(module = %module_id, status = %stored.status, "module stored");
        stored
    }

    pub fn get(&self, name: &str) -> Option<Module> {
        self.modules.read().get(&ModuleId::from(name)).cloned()
    }

    pub fn require(&self, name: &str) -> RuntimeResult<Module> {
        self.get(name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(&ModuleId::from(name))
    }

    /// Modules in insertion order.
    pub fn list(&self) -> Vec<Module> {
        self.modules.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, name: &str) -> Option<Module> {
        let removed = self.modules.write().shift_remove(&ModuleId::from(name));
        if removed.is_some() {
            info!(module = name, "module removed from registry");
        }
        removed
    }

    fn mutate<T>(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Module) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let mut modules = self.modules.write();
        let module = modules
            .get_mut(&ModuleId::from(name))
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_owned()))?;
        let result = apply(module)?;
        module.updated_at = Utc::now();
        Ok(result)
    }

    /// Move a module along its lifecycle; rejects transitions the state
    /// machine does not allow.
    pub fn set_status(&self, name: &str, next: ModuleStatus) -> RuntimeResult<Module> {
        let (from, module) = self.mutate(name, |module| {
            let from = module.status;
            if !from.can_transition_to(next) {
                return Err(RuntimeError::InvalidTransition {
                    subject: format!("module {name}"),
                    from: from.to_string(),
                    to: next.to_string(),
                });
            }
            module.status = next;
            match next {
                ModuleStatus::Running => {
                    module.started_at = Some(Utc::now());
                    module.last_error = None;
                }
                ModuleStatus::Stopped => module.stopped_at = Some(Utc::now()),
                _ => {}
            }
            Ok((from, module.clone()))
        })?;
        debug!(module = name, from = %from, to = %next, "module status changed");
        self.record(&module.name, ModuleEventKind::StatusChanged { from, to: next });
        Ok(module)
    }

    /// Mark a module failed and remember why.
    pub fn set_error(&self, name: &str, message: impl Into<String>) -> RuntimeResult<Module> {
        let message = message.into();
        self.mutate(name, |module| {
            module.last_error = Some(message.clone());
            Ok(())
        })?;
        self.set_status(name, ModuleStatus::Error)
    }

    pub fn set_last_error(&self, name: &str, message: impl Into<String>) -> RuntimeResult<()> {
        let message = message.into();
        self.mutate(name, |module| {
            module.last_error = Some(message);
            Ok(())
        })
    }

    pub fn record_health(&self, name: &str, health: &ModuleHealth) -> RuntimeResult<()> {
        let module_id = self.mutate(name, |module| {
            module.health = if health.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            module.health_message = Some(health.message.clone());
            Ok(module.name.clone())
        })?;
        self.record(
            &module_id,
            ModuleEventKind::HealthChecked {
                healthy: health.healthy,
                message: health.message.clone(),
            },
        );
        Ok(())
    }

    pub fn set_config(&self, name: &str, key: &str, value: Value) -> RuntimeResult<()> {
        let module_id = self.mutate(name, |module| {
            module.config.insert(key.to_owned(), value);
            Ok(module.name.clone())
        })?;
        self.record(
            &module_id,
            ModuleEventKind::ConfigChanged {
                key: key.to_owned(),
            },
        );
        Ok(())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> RuntimeResult<()> {
        self.mutate(name, |module| {
            module.enabled = enabled;
            Ok(())
        })
    }

    /// Audit log, oldest first, optionally filtered to one module.
    pub fn events(&self, name: Option<&str>) -> Vec<ModuleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| name.is_none_or(|name| event.module_id.as_str() == name))
            .cloned()
            .collect()
    }
}
