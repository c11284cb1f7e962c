//! Dependency-ordered start and reverse-order stop of registered modules.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use modos_events::EventBus;
use modos_protocol::{
    EventPayload, Module, ModuleHealth, ModuleId, ModuleShutdown, ModuleStatus, RuntimeError,
    RuntimeResult, names,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::hooks::{ModuleContext, ModuleFactoryRegistry, ModuleHooks};
use crate::registry::ModuleRegistry;
use crate::resolver::{resolve_closure, resolve_order};

/// Drives modules through their lifecycle in dependency order.
pub struct LifecycleOrchestrator {
    bus: EventBus,
    registry: Arc<ModuleRegistry>,
    factories: ModuleFactoryRegistry,
    instances: Mutex<HashMap<ModuleId, Arc<dyn ModuleHooks>>>,
    started: Mutex<Vec<ModuleId>>,
}

impl std::fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("started", &*self.started.lock())
            .finish()
    }
}

impl LifecycleOrchestrator {
    pub fn new(
        bus: EventBus,
        registry: Arc<ModuleRegistry>,
        factories: ModuleFactoryRegistry,
    ) -> Self {
        Self {
            bus,
            registry,
            factories,
            instances: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Start every enabled auto-start module, dependencies first.
    ///
    /// Resolution errors abort before any module is touched. A module whose
    /// dependencies are not all running by its turn is left untouched. The
    /// first start failure marks that module `error` and aborts the rest.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> RuntimeResult<Vec<ModuleId>> {
        let order = resolve_order(&self.registry.list())?;
        let mut started = Vec::new();
        for name in &order {
            let Some(module) = self.registry.get(name.as_str()) else {
                continue;
            };
            if module.is_running() {
                debug!(module = %name, "already running");
                continue;
            }
            if !module.enabled || !module.auto_start {
                debug!(module = %name, enabled = module.enabled, auto_start = module.auto_start, "not auto-started");
                continue;
            }
            if let Some(dependency) = self.idle_dependency(&module) {
                warn!(module = %name, dependency = %dependency, "dependency not running, module not started");
                continue;
            }
            self.start_one(module).await?;
            started.push(name.clone());
        }
        info!(started = started.len(), total = order.len(), "modules started");
        Ok(started)
    }

    fn idle_dependency<'a>(&self, module: &'a Module) -> Option<&'a ModuleId> {
        module.dependencies.iter().find(|dependency| {
            !self
                .registry
                .get(dependency.as_str())
                .is_some_and(|found| found.is_running())
        })
    }

    /// Start one module and whatever it depends on that is not yet running.
    #[instrument(skip(self))]
    pub async fn start_module(&self, name: &str) -> RuntimeResult<Module> {
        let order = resolve_closure(&self.registry.list(), name)?;
        for id in &order {
            let module = self.registry.require(id.as_str())?;
            if module.is_running() {
                continue;
            }
            if !module.enabled {
                return Err(RuntimeError::ModuleStartFailure {
                    module: id.to_string(),
                    reason: "module is disabled".to_owned(),
                });
            }
            self.start_one(module).await?;
        }
        self.registry.require(name)
    }

    async fn start_one(&self, module: Module) -> RuntimeResult<()> {
        let name = module.name.clone();
        if module.status == ModuleStatus::Discovered {
            self.registry.set_status(name.as_str(), ModuleStatus::Installed)?;
        }
        let module = self.registry.set_status(name.as_str(), ModuleStatus::Loading)?;

        let hooks = match self.factories.instantiate(&module) {
            Ok(hooks) => hooks,
            Err(error) => return Err(self.fail_start(&name, format!("{error:#}"))),
        };
        let context = ModuleContext::new(module, self.bus.clone());
        match AssertUnwindSafe(hooks.start(&context)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(self.fail_start(&name, format!("{error:#}"))),
            Err(_) => return Err(self.fail_start(&name, "start hook panicked".to_owned())),
        }

        self.registry.set_status(name.as_str(), ModuleStatus::Running)?;
        self.instances.lock().insert(name.clone(), hooks);
        {
            let mut started = self.started.lock();
            started.retain(|entry| entry != &name);
            started.push(name.clone());
        }
        info!(module = %name, "module running");
        Ok(())
    }

    /// Record the failure and withdraw anything the module registered
    /// before its start hook gave up.
    fn fail_start(&self, name: &ModuleId, reason: String) -> RuntimeError {
        warn!(module = %name, reason = %reason, "module failed to start");
        if let Err(error) = self.registry.set_error(name.as_str(), reason.clone()) {
            warn!(module = %name, error = %error, "could not record start failure");
        }
        self.bus.emit(
            names::MODULE_SHUTDOWN,
            EventPayload::ModuleShutdown(ModuleShutdown {
                module_id: name.clone(),
            }),
        );
        RuntimeError::ModuleStartFailure {
            module: name.to_string(),
            reason,
        }
    }

    /// Stop running modules in reverse start order.
    ///
    /// Stop failures never abort the sweep; the module still ends `stopped`
    /// with the failure kept in `last_error`.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Vec<RuntimeError> {
        let mut order: Vec<ModuleId> = self.started.lock().iter().rev().cloned().collect();
        for module in self.registry.list().into_iter().rev() {
            if !order.contains(&module.name) {
                order.push(module.name);
            }
        }

        let mut failures = Vec::new();
        let mut stopped = 0usize;
        for name in order {
            let Some(module) = self.registry.get(name.as_str()) else {
                continue;
            };
            if !module.is_running() {
                continue;
            }
            stopped += 1;
            if let Err(error) = self.stop_one(module).await {
                failures.push(error);
            }
        }
        info!(stopped, failures = failures.len(), "modules stopped");
        failures
    }

    #[instrument(skip(self))]
    pub async fn stop_module(&self, name: &str) -> RuntimeResult<Module> {
        let module = self.registry.require(name)?;
        if !module.is_running() {
            return Err(RuntimeError::InvalidTransition {
                subject: format!("module {name}"),
                from: module.status.to_string(),
                to: ModuleStatus::Stopping.to_string(),
            });
        }
        if let Err(error) = self.stop_one(module).await {
            warn!(module = name, error = %error, "module stopped with errors");
        }
        self.registry.require(name)
    }

    /// Mark every running or stopping module `stopped` without calling any
    /// hook. Used when a graceful shutdown overran its budget.
    pub fn force_stop_all(&self) -> usize {
        let mut forced = 0usize;
        for module in self.registry.list().into_iter().rev() {
            let name = module.name.clone();
            let moved = match module.status {
                ModuleStatus::Running => self
                    .registry
                    .set_status(name.as_str(), ModuleStatus::Stopping)
                    .and_then(|_| self.registry.set_status(name.as_str(), ModuleStatus::Stopped)),
                ModuleStatus::Stopping => self.registry.set_status(name.as_str(), ModuleStatus::Stopped),
                _ => continue,
            };
            if let Err(error) = moved.and_then(|_| self.registry.set_last_error(name.as_str(), "forced shutdown")) {
                warn!(module = %name, error = %error, "could not force module stopped");
                continue;
            }
            forced += 1;
            self.bus.emit(
                names::MODULE_SHUTDOWN,
                EventPayload::ModuleShutdown(ModuleShutdown { module_id: name }),
            );
        }
        self.instances.lock().clear();
        self.started.lock().clear();
        if forced > 0 {
            warn!(forced, "modules force-stopped");
        }
        forced
    }

    async fn stop_one(&self, module: Module) -> RuntimeResult<()> {
        let name = module.name.clone();
        let module = self.registry.set_status(name.as_str(), ModuleStatus::Stopping)?;
        let hooks = self.instances.lock().remove(&name);
        let outcome = match hooks {
            Some(hooks) => {
                let context = ModuleContext::new(module, self.bus.clone());
                match AssertUnwindSafe(hooks.stop(&context)).catch_unwind().await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(format!("{error:#}")),
                    Err(_) => Err("stop hook panicked".to_owned()),
                }
            }
            None => Ok(()),
        };

        self.registry.set_status(name.as_str(), ModuleStatus::Stopped)?;
        self.started.lock().retain(|entry| entry != &name);
        self.bus.emit(
            names::MODULE_SHUTDOWN,
            EventPayload::ModuleShutdown(ModuleShutdown {
                module_id: name.clone(),
            }),
        );

        match outcome {
            Ok(()) => {
                info!(module = %name, "module stopped");
                Ok(())
            }
            Err(reason) => {
                warn!(module = %name, reason = %reason, "module stop hook failed");
                self.registry.set_last_error(name.as_str(), reason.clone())?;
                Err(RuntimeError::ModuleStopFailure {
                    module: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Probe every module. Modules that are not running report their state
    /// without calling a hook.
    #[instrument(skip(self))]
    pub async fn health_check_all(&self) -> BTreeMap<ModuleId, ModuleHealth> {
        let mut results = BTreeMap::new();
        for module in self.registry.list() {
            let name = module.name.clone();
            let health = self.health_check(module).await;
            if let Err(error) = self.registry.record_health(name.as_str(), &health) {
                warn!(module = %name, error = %error, "could not record health");
            }
            results.insert(name, health);
        }
        results
    }

    async fn health_check(&self, module: Module) -> ModuleHealth {
        if !module.is_running() {
            return ModuleHealth::unhealthy(format!("module is {}", module.status));
        }
        let hooks = self.instances.lock().get(&module.name).cloned();
        let Some(hooks) = hooks else {
            return ModuleHealth::healthy("no health check implemented");
        };
        let context = ModuleContext::new(module, self.bus.clone());
        match AssertUnwindSafe(hooks.health(&context)).catch_unwind().await {
            Ok(health) => health,
            Err(_) => ModuleHealth::unhealthy("health check panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;

    use super::*;
    use crate::scanner::ModuleScanner;
    use modos_protocol::ModuleType;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("modos-lifecycle-{name}-{nanos}"))
    }

    /// Records hook calls into a shared journal.
    struct Journal {
        entries: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl ModuleHooks for Journal {
        async fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
            self.entries
                .lock()
                .push(format!("start:{}", context.module.name));
            if self.fail_start {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }

        async fn stop(&self, context: &ModuleContext) -> anyhow::Result<()> {
            self.entries
                .lock()
                .push(format!("stop:{}", context.module.name));
            if self.fail_stop {
                anyhow::bail!("refusing to stop");
            }
            Ok(())
        }

        async fn health(&self, _context: &ModuleContext) -> ModuleHealth {
            if self.fail_start {
                ModuleHealth::unhealthy("broken")
            } else {
                ModuleHealth::healthy("ok")
            }
        }
    }

    struct Fixture {
        bus: EventBus,
        registry: Arc<ModuleRegistry>,
        orchestrator: LifecycleOrchestrator,
        journal: Arc<Mutex<Vec<String>>>,
    }

    /// `modules` pairs a name with its comma-separated dependencies.
    fn fixture(modules: &[(&str, &str)], failing_start: &[&str], failing_stop: &[&str]) -> Fixture {
        let bus = EventBus::new();
        let registry = Arc::new(ModuleRegistry::new(bus.clone()));
        let journal = Arc::new(Mutex::new(Vec::new()));
        let factories = ModuleFactoryRegistry::new();
        for (name, dependencies) in modules {
            registry.upsert_discovered(
                Module::new(*name, "1.0.0", ModuleType::Service, format!("/m/{name}"))
                    .with_dependencies(dependencies.split(',').filter(|dep| !dep.is_empty())),
            );
            let entries = Arc::clone(&journal);
            let fail_start = failing_start.contains(name);
            let fail_stop = failing_stop.contains(name);
            factories.register(*name, move |_| {
                Ok(Arc::new(Journal {
                    entries: Arc::clone(&entries),
                    fail_start,
                    fail_stop,
                }) as Arc<dyn ModuleHooks>)
            });
        }
        let orchestrator = LifecycleOrchestrator::new(bus.clone(), Arc::clone(&registry), factories);
        Fixture {
            bus,
            registry,
            orchestrator,
            journal,
        }
    }

    #[tokio::test]
    async fn starts_in_dependency_order_and_stops_in_reverse() -> anyhow::Result<()> {
        let fx = fixture(&[("a", "b"), ("b", "c"), ("c", "")], &[], &[]);
        let shutdowns = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shutdowns);
        fx.bus.on(names::MODULE_SHUTDOWN, move |event| {
            if let EventPayload::ModuleShutdown(shutdown) = &event.payload {
                sink.lock().push(shutdown.module_id.to_string());
            }
            Ok(())
        });

        let started = fx.orchestrator.start_all().await?;
        assert_eq!(started, vec![ModuleId::from("c"), "b".into(), "a".into()]);
        for name in ["a", "b", "c"] {
            assert_eq!(fx.registry.get(name).unwrap().status, ModuleStatus::Running);
        }

        let failures = fx.orchestrator.stop_all().await;
        assert!(failures.is_empty());
        assert_eq!(
            *fx.journal.lock(),
            vec!["start:c", "start:b", "start:a", "stop:a", "stop:b", "stop:c"]
        );
        assert_eq!(*shutdowns.lock(), vec!["a", "b", "c"]);
        for name in ["a", "b", "c"] {
            assert_eq!(fx.registry.get(name).unwrap().status, ModuleStatus::Stopped);
        }
        Ok(())
    }

    #[tokio::test]
    async fn cycle_starts_nothing() -> anyhow::Result<()> {
        let fx = fixture(&[("a", "b"), ("b", "a"), ("c", "")], &[], &[]);
        let error = fx.orchestrator.start_all().await.unwrap_err();
        assert!(matches!(error, RuntimeError::CircularDependency(_)));
        assert!(fx.journal.lock().is_empty());
        for name in ["a", "b", "c"] {
            assert_eq!(fx.registry.get(name).unwrap().status, ModuleStatus::Installed);
        }
        Ok(())
    }

    #[tokio::test]
    async fn start_failure_aborts_remaining() -> anyhow::Result<()> {
        let fx = fixture(&[("a", "b"), ("b", ""), ("c", "")], &["b"], &[]);
        let error = fx.orchestrator.start_all().await.unwrap_err();
        assert!(matches!(
            &error,
            RuntimeError::ModuleStartFailure { module, .. } if module == "b"
        ));
        let b = fx.registry.get("b").unwrap();
        assert_eq!(b.status, ModuleStatus::Error);
        assert_eq!(b.last_error.as_deref(), Some("refusing to start"));
        assert_eq!(fx.registry.get("a").unwrap().status, ModuleStatus::Installed);
        assert_eq!(fx.registry.get("c").unwrap().status, ModuleStatus::Installed);
        Ok(())
    }

    #[tokio::test]
    async fn failed_start_announces_shutdown() -> anyhow::Result<()> {
        let fx = fixture(&[("b", "")], &["b"], &[]);
        let shutdowns = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shutdowns);
        fx.bus.on(names::MODULE_SHUTDOWN, move |event| {
            if let EventPayload::ModuleShutdown(shutdown) = &event.payload {
                sink.lock().push(shutdown.module_id.to_string());
            }
            Ok(())
        });

        assert!(fx.orchestrator.start_all().await.is_err());
        assert_eq!(*shutdowns.lock(), vec!["b"]);
        assert_eq!(fx.registry.get("b").unwrap().status, ModuleStatus::Error);
        Ok(())
    }

    #[tokio::test]
    async fn dependents_of_skipped_modules_are_not_started() -> anyhow::Result<()> {
        let fx = fixture(&[("api", "db"), ("db", ""), ("cache", "")], &[], &[]);
        fx.registry.set_enabled("db", false)?;

        let started = fx.orchestrator.start_all().await?;
        assert_eq!(started, vec![ModuleId::from("cache")]);
        assert_eq!(*fx.journal.lock(), vec!["start:cache"]);
        assert_eq!(fx.registry.get("api").unwrap().status, ModuleStatus::Installed);
        assert_eq!(fx.registry.get("db").unwrap().status, ModuleStatus::Installed);
        Ok(())
    }

    #[tokio::test]
    async fn stop_failure_still_stops() -> anyhow::Result<()> {
        let fx = fixture(&[("a", ""), ("b", "")], &[], &["a"]);
        fx.orchestrator.start_all().await?;
        let failures = fx.orchestrator.stop_all().await;
        assert_eq!(failures.len(), 1);
        let a = fx.registry.get("a").unwrap();
        assert_eq!(a.status, ModuleStatus::Stopped);
        assert_eq!(a.last_error.as_deref(), Some("refusing to stop"));
        assert_eq!(fx.registry.get("b").unwrap().status, ModuleStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn force_stop_skips_hooks() -> anyhow::Result<()> {
        let fx = fixture(&[("a", ""), ("b", "a")], &[], &[]);
        fx.orchestrator.start_all().await?;
        assert_eq!(fx.orchestrator.force_stop_all(), 2);
        assert_eq!(*fx.journal.lock(), vec!["start:a", "start:b"]);
        for name in ["a", "b"] {
            let module = fx.registry.get(name).unwrap();
            assert_eq!(module.status, ModuleStatus::Stopped);
            assert_eq!(module.last_error.as_deref(), Some("forced shutdown"));
        }
        assert!(fx.orchestrator.stop_all().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_and_manual_modules_are_skipped() -> anyhow::Result<()> {
        let fx = fixture(&[("a", ""), ("b", "")], &[], &[]);
        fx.registry.set_enabled("a", false)?;
        let mut manual = fx.registry.get("b").unwrap();
        manual.auto_start = false;
        fx.registry.upsert_discovered(manual);

        let started = fx.orchestrator.start_all().await?;
        assert!(started.is_empty());

        let b = fx.orchestrator.start_module("b").await?;
        assert_eq!(b.status, ModuleStatus::Running);
        assert!(fx.orchestrator.start_module("a").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn start_module_pulls_in_dependencies() -> anyhow::Result<()> {
        let fx = fixture(&[("api", "db"), ("db", ""), ("other", "")], &[], &[]);
        fx.orchestrator.start_module("api").await?;
        assert_eq!(*fx.journal.lock(), vec!["start:db", "start:api"]);
        assert_eq!(fx.registry.get("other").unwrap().status, ModuleStatus::Installed);

        let db = fx.orchestrator.stop_module("db").await?;
        assert_eq!(db.status, ModuleStatus::Stopped);
        assert!(fx.orchestrator.stop_module("db").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn health_check_reports_each_module() -> anyhow::Result<()> {
        let fx = fixture(&[("a", ""), ("idle", "")], &[], &[]);
        fx.orchestrator.start_module("a").await?;
        let report = fx.orchestrator.health_check_all().await;
        assert!(report[&ModuleId::from("a")].healthy);
        assert!(!report[&ModuleId::from("idle")].healthy);
        assert_eq!(
            fx.registry.get("a").unwrap().health,
            modos_protocol::HealthStatus::Healthy
        );
        Ok(())
    }

    #[tokio::test]
    async fn scanned_echo_module_runs() -> anyhow::Result<()> {
        let root = unique_test_root("echo");
        let echo = root.join("echo");
        tokio::fs::create_dir_all(&echo).await?;
        tokio::fs::write(
            echo.join("module.yaml"),
            "name: echo\nversion: 1.0.0\ntype: service\n",
        )
        .await?;
        tokio::fs::write(echo.join("index.js"), "export default {};\n").await?;

        let bus = EventBus::new();
        let registry = Arc::new(ModuleRegistry::new(bus.clone()));
        let report = ModuleScanner::new([&root]).scan().await?;
        for module in report.discovered {
            registry.upsert_discovered(module);
        }
        assert_eq!(registry.get("echo").unwrap().status, ModuleStatus::Installed);

        let orchestrator =
            LifecycleOrchestrator::new(bus, Arc::clone(&registry), ModuleFactoryRegistry::new());
        orchestrator.start_all().await?;
        assert_eq!(registry.get("echo").unwrap().status, ModuleStatus::Running);

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }
}
