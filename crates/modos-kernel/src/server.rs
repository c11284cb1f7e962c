//! The server core and its start and stop sequences.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use modos_endpoints::EndpointRegistry;
use modos_events::{EventBus, ListenerId};
use modos_modules::{LifecycleOrchestrator, ModuleFactoryRegistry, ModuleRegistry, ModuleScanner};
use modos_policy::RoutePolicy;
use modos_protocol::{
    CanonicalResponse, EventPayload, ModuleStatus, ProtocolHandler, ProtocolStatus, RuntimeError,
    RuntimeResult, ServerStatus, names,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::ModuleBridge;
use crate::config::ServerConfig;
use crate::services::ServiceRegistry;

/// How [`Server::stop`] should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    pub graceful: bool,
    /// Overrides the configured graceful budget.
    pub graceful_timeout: Option<Duration>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            graceful_timeout: None,
        }
    }
}

impl StopOptions {
    pub fn forced() -> Self {
        Self {
            graceful: false,
            graceful_timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            graceful: true,
            graceful_timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSnapshot {
    pub name: String,
    pub status: ProtocolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Point-in-time view of the server for status endpoints and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub modules: usize,
    pub running_modules: usize,
    pub endpoints: usize,
    pub pending_calls: usize,
    pub active_handlers: usize,
    pub protocols: Vec<ProtocolSnapshot>,
    pub bound_ports: BTreeMap<String, u16>,
}

/// The server core: owns the bus, the route table, the module registry and
/// orchestrator, the service registry, and every protocol handler.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    bus: EventBus,
    endpoints: Arc<EndpointRegistry>,
    modules: Arc<ModuleRegistry>,
    lifecycle: Arc<LifecycleOrchestrator>,
    scanner: ModuleScanner,
    services: ServiceRegistry,
    policy: RoutePolicy,
    bridge: ModuleBridge,
    protocols: RwLock<Vec<Arc<dyn ProtocolHandler>>>,
    status: Mutex<ServerStatus>,
    wiring: Mutex<Vec<(&'static str, ListenerId)>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    bound_ports: Arc<Mutex<BTreeMap<String, u16>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    /// Serializes start, stop, and restart.
    control: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("status", &self.status())
            .field("modules", &self.inner.modules.len())
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, factories: ModuleFactoryRegistry) -> Self {
        let bus = EventBus::new();
        let endpoints = Arc::new(EndpointRegistry::new());
        let modules = Arc::new(ModuleRegistry::new(bus.clone()));
        let lifecycle = Arc::new(LifecycleOrchestrator::new(
            bus.clone(),
            Arc::clone(&modules),
            factories,
        ));
        let scanner = ModuleScanner::new(config.module_dirs.iter().cloned());
        let policy = RoutePolicy::new(bus.clone(), config.auth);
        let bridge = ModuleBridge::new(
            bus.clone(),
            Arc::clone(&endpoints),
            policy.clone(),
            config.middleware_grace(),
        );

        let services = ServiceRegistry::new();
        services.register("bus", Arc::new(bus.clone()));
        services.register("endpoints", Arc::clone(&endpoints));
        services.register("modules", Arc::clone(&modules));
        services.register("bridge", Arc::new(bridge.clone()));

        Self {
            inner: Arc::new(ServerInner {
                config,
                bus,
                endpoints,
                modules,
                lifecycle,
                scanner,
                services,
                policy,
                bridge,
                protocols: RwLock::new(Vec::new()),
                status: Mutex::new(ServerStatus::Initialized),
                wiring: Mutex::new(Vec::new()),
                sweeper: Mutex::new(None),
                bound_ports: Arc::new(Mutex::new(BTreeMap::new())),
                started_at: Mutex::new(None),
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Attach a protocol handler. Takes effect on the next start.
    pub fn add_protocol(&self, protocol: Arc<dyn ProtocolHandler>) {
        info!(protocol = protocol.name(), "protocol attached");
        self.inner.protocols.write().push(protocol);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.inner.endpoints
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.inner.modules
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleOrchestrator> {
        &self.inner.lifecycle
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.inner.policy
    }

    pub fn bridge(&self) -> &ModuleBridge {
        &self.inner.bridge
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.status.lock()
    }

    pub fn bound_port(&self, protocol: &str) -> Option<u16> {
        self.inner.bound_ports.lock().get(protocol).copied()
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let modules = self.inner.modules.list();
        let protocols = self
            .protocols()
            .iter()
            .map(|protocol| ProtocolSnapshot {
                name: protocol.name().to_owned(),
                status: protocol.status(),
                port: protocol.bound_port(),
            })
            .collect();
        ServerSnapshot {
            status: self.status(),
            started_at: *self.inner.started_at.lock(),
            running_modules: modules
                .iter()
                .filter(|module| module.status == ModuleStatus::Running)
                .count(),
            modules: modules.len(),
            endpoints: self.inner.endpoints.len(),
            pending_calls: self.inner.bus.pending_count(),
            active_handlers: self.inner.bus.active_handlers(),
            protocols,
            bound_ports: self.inner.bound_ports.lock().clone(),
        }
    }

    /// Wire the bus, discover modules, and bring everything up.
    ///
    /// Any failure leaves the server in `error` with modules and protocols
    /// wound back down.
    #[instrument(skip(self))]
    pub async fn start(&self) -> RuntimeResult<()> {
        let _control = self.inner.control.lock().await;
        self.transition(ServerStatus::Starting)?;
        match self.start_sequence().await {
            Ok(()) => {
                *self.inner.started_at.lock() = Some(Utc::now());
                self.transition(ServerStatus::Running)?;
                info!(
                    modules = self.inner.modules.len(),
                    endpoints = self.inner.endpoints.len(),
                    "server running"
                );
                Ok(())
            }
            Err(cause) => {
                error!(error = %cause, "server failed to start");
                self.abort_start().await;
                self.transition(ServerStatus::Error)?;
                Err(cause)
            }
        }
    }

    async fn start_sequence(&self) -> RuntimeResult<()> {
        self.wire();

        let report = self
            .inner
            .scanner
            .scan()
            .await
            .map_err(|error| RuntimeError::Internal(format!("{error:#}")))?;
        for skipped in &report.skipped {
            warn!(path = %skipped.path.display(), reason = %skipped.reason, "module not loaded");
        }
        for module in report.discovered {
            self.inner.modules.upsert_discovered(module);
        }

        let protocols = self.protocols();
        for protocol in &protocols {
            protocol.initialize().await?;
        }
        self.inner.lifecycle.start_all().await?;
        for protocol in &protocols {
            protocol.start().await?;
            debug!(protocol = protocol.name(), "protocol started");
        }
        self.spawn_sweeper();
        Ok(())
    }

    async fn abort_start(&self) {
        for protocol in self.protocols().iter().rev() {
            protocol.force_stop().await;
        }
        for failure in self.inner.lifecycle.stop_all().await {
            warn!(error = %failure, "module stop failed during start rollback");
        }
        self.stop_sweeper();
        self.unwire();
    }

    /// Stop the server. The graceful sequence is raced against its budget;
    /// on expiry the forced path clears pending calls and closes protocols
    /// without waiting.
    #[instrument(skip(self))]
    pub async fn stop(&self, options: StopOptions) -> RuntimeResult<()> {
        let _control = self.inner.control.lock().await;
        let current = self.status();
        if matches!(
            current,
            ServerStatus::Initialized | ServerStatus::Stopped | ServerStatus::Error
        ) {
            debug!(status = %current, "server not running, nothing to stop");
            return Ok(());
        }
        self.transition(ServerStatus::Stopping)?;
        self.stop_sweeper();

        let budget = options
            .graceful_timeout
            .unwrap_or_else(|| self.inner.config.graceful_timeout());
        let completed = options.graceful
            && tokio::time::timeout(budget, self.graceful_sequence(budget))
                .await
                .unwrap_or(false);
        if !completed {
            warn!(
                graceful = options.graceful,
                budget_ms = budget.as_millis() as u64,
                "forcing shutdown"
            );
            self.force_sequence().await;
        }

        self.unwire();
        *self.inner.started_at.lock() = None;
        if let Err(cause) = self.transition(ServerStatus::Stopped) {
            self.transition(ServerStatus::Error)?;
            return Err(cause);
        }
        info!(forced = !completed, "server stopped");
        Ok(())
    }

    /// Protocols first, then in-flight handlers, then modules. Returns
    /// `false` when handlers did not drain in time.
    async fn graceful_sequence(&self, budget: Duration) -> bool {
        for protocol in self.protocols().iter().rev() {
            if let Err(cause) = protocol.stop().await {
                warn!(protocol = protocol.name(), error = %cause, "protocol stop failed");
            }
        }
        if !self.inner.bus.wait_for_active_handlers(budget).await {
            return false;
        }
        for failure in self.inner.lifecycle.stop_all().await {
            warn!(error = %failure, "module stop failed");
        }
        true
    }

    async fn force_sequence(&self) {
        self.inner.bus.clear_pending();
        for protocol in self.protocols().iter().rev() {
            protocol.force_stop().await;
        }
        self.inner.lifecycle.force_stop_all();
    }

    pub async fn restart(&self) -> RuntimeResult<()> {
        info!("server restarting");
        self.stop(StopOptions::default()).await?;
        self.start().await
    }

    fn protocols(&self) -> Vec<Arc<dyn ProtocolHandler>> {
        self.inner.protocols.read().clone()
    }

    fn transition(&self, next: ServerStatus) -> RuntimeResult<()> {
        let previous = {
            let mut status = self.inner.status.lock();
            let previous = *status;
            if !previous.can_transition_to(next) {
                return Err(RuntimeError::InvalidTransition {
                    subject: "server".to_owned(),
                    from: previous.to_string(),
                    to: next.to_string(),
                });
            }
            *status = next;
            previous
        };
        debug!(from = %previous, to = %next, "server status changed");
        self.inner.bus.emit(
            names::SERVER_STATUS,
            EventPayload::Custom(json!({
                "previous": previous.as_str(),
                "status": next.as_str(),
            })),
        );
        Ok(())
    }

    fn wire(&self) {
        let mut wiring = self.inner.wiring.lock();
        if !wiring.is_empty() {
            return;
        }
        let bus = &self.inner.bus;

        let endpoints = Arc::clone(&self.inner.endpoints);
        let default_timeout_ms = self.inner.config.default_route_timeout_ms;
        let register = bus.on(names::REGISTER_ENDPOINTS, move |event| {
            let EventPayload::RegisterEndpoints(registration) = &event.payload else {
                return Ok(());
            };
            let definitions = registration
                .endpoints
                .iter()
                .cloned()
                .map(|mut definition| {
                    if definition.timeout_ms == 0 {
                        definition.timeout_ms = default_timeout_ms;
                    }
                    definition
                })
                .collect();
            let reply = match endpoints.register_module_endpoints(&registration.module_id, definitions) {
                Ok(_) => EventPayload::Empty,
                Err(cause) => {
                    warn!(module = %registration.module_id, error = %cause, "endpoint registration rejected");
                    EventPayload::Response(CanonicalResponse::from_error(&cause))
                }
            };
            event.reply(reply);
            Ok(())
        });

        let endpoints = Arc::clone(&self.inner.endpoints);
        let shutdown = bus.on(names::MODULE_SHUTDOWN, move |event| {
            if let EventPayload::ModuleShutdown(shutdown) = &event.payload {
                let removed = endpoints.unregister_module_endpoints(&shutdown.module_id);
                debug!(module = %shutdown.module_id, removed, "module endpoints removed");
            }
            Ok(())
        });

        let ports = Arc::clone(&self.inner.bound_ports);
        let bound = bus.on(names::PORT_BOUND, move |event| {
            if let EventPayload::PortBound(bound) = &event.payload {
                info!(protocol = %bound.protocol, address = %bound.address, port = bound.port, "port bound");
                ports.lock().insert(bound.protocol.clone(), bound.port);
            }
            Ok(())
        });

        wiring.extend([
            (names::REGISTER_ENDPOINTS, register),
            (names::MODULE_SHUTDOWN, shutdown),
            (names::PORT_BOUND, bound),
        ]);
    }

    fn unwire(&self) {
        for (pattern, listener) in self.inner.wiring.lock().drain(..) {
            self.inner.bus.off(pattern, listener);
        }
    }

    fn spawn_sweeper(&self) {
        let bus = self.inner.bus.clone();
        let limiter = Arc::clone(self.inner.policy.limiter());
        let interval = self.inner.config.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let calls = bus.sweep_expired();
                let windows = limiter.sweep_expired();
                if calls + windows > 0 {
                    debug!(calls, windows, "expired entries swept");
                }
            }
        });
        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use modos_modules::{ModuleContext, ModuleHooks};
    use modos_protocol::{EndpointDefinition, InboundRequest, Method, PortBound};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("modos-server-{name}-{nanos}"))
    }

    async fn write_module(root: &Path, name: &str) -> anyhow::Result<()> {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(
            dir.join("module.yaml"),
            format!("name: {name}\nversion: 1.0.0\ntype: service\n"),
        )
        .await?;
        tokio::fs::write(dir.join("index.js"), "export default {};\n").await?;
        Ok(())
    }

    /// Registers `GET /greet` and answers it.
    struct Greeter;

    #[async_trait]
    impl ModuleHooks for Greeter {
        async fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
            context.bus.on("greeter.hello", |event| {
                event.reply(EventPayload::Response(CanonicalResponse::ok(json!("hello"))));
                Ok(())
            });
            context
                .register_endpoints(vec![
                    EndpointDefinition::new(Method::Get, "/greet", "greeter.hello").with_timeout_ms(0),
                ])
                .await?;
            Ok(())
        }
    }

    fn config(root: &Path) -> ServerConfig {
        ServerConfig {
            module_dirs: vec![root.to_path_buf()],
            graceful_timeout_ms: 1_000,
            ..ServerConfig::default()
        }
    }

    #[derive(Default)]
    struct FakeProtocol {
        status: Mutex<ProtocolStatus>,
        bus: Mutex<Option<EventBus>>,
        stops: AtomicUsize,
        force_stops: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolHandler for FakeProtocol {
        fn name(&self) -> &str {
            "fake"
        }

        fn status(&self) -> ProtocolStatus {
            *self.status.lock()
        }

        async fn initialize(&self) -> RuntimeResult<()> {
            Ok(())
        }

        async fn start(&self) -> RuntimeResult<()> {
            *self.status.lock() = ProtocolStatus::Running;
            if let Some(bus) = self.bus.lock().as_ref() {
                bus.emit(
                    names::PORT_BOUND,
                    EventPayload::PortBound(PortBound {
                        protocol: "fake".into(),
                        address: "127.0.0.1".into(),
                        port: 40_123,
                    }),
                );
            }
            Ok(())
        }

        async fn stop(&self) -> RuntimeResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.status.lock() = ProtocolStatus::Stopped;
            Ok(())
        }

        async fn force_stop(&self) {
            self.force_stops.fetch_add(1, Ordering::SeqCst);
            *self.status.lock() = ProtocolStatus::Stopped;
        }
    }

    #[tokio::test]
    async fn modules_register_routes_through_the_bus() -> anyhow::Result<()> {
        let root = unique_test_root("routes");
        write_module(&root, "greeter").await?;
        let factories = ModuleFactoryRegistry::new();
        factories.register("greeter", |_| Ok(Arc::new(Greeter) as Arc<dyn ModuleHooks>));
        let server = Server::new(config(&root), factories);

        server.start().await?;
        assert_eq!(server.status(), ServerStatus::Running);
        let endpoint = server
            .endpoints()
            .match_endpoint(Method::Get, "/greet")
            .expect("route registered");
        assert_eq!(
            endpoint.endpoint.definition.timeout_ms,
            server.config().default_route_timeout_ms
        );

        let response = server
            .bridge()
            .dispatch(InboundRequest::new(Method::Get, "/greet"))
            .await;
        assert_eq!(response, CanonicalResponse::ok(json!("hello")));

        server.stop(StopOptions::default()).await?;
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.endpoints().is_empty());
        assert_eq!(
            server.modules().get("greeter").unwrap().status,
            ModuleStatus::Stopped
        );

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn forced_stop_does_not_wait_for_slow_handlers() -> anyhow::Result<()> {
        let root = unique_test_root("forced");
        write_module(&root, "worker").await?;
        let server = Server::new(config(&root), ModuleFactoryRegistry::new());
        let protocol = Arc::new(FakeProtocol::default());
        server.add_protocol(protocol.clone());
        server.start().await?;

        server.bus().on_async("worker.slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        server.bus().emit("worker.slow", EventPayload::Empty);
        assert_eq!(server.bus().active_handlers(), 1);

        let started = Instant::now();
        server
            .stop(StopOptions::with_timeout(Duration::from_millis(50)))
            .await?;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert_eq!(server.bus().pending_count(), 0);
        assert_eq!(protocol.force_stops.load(Ordering::SeqCst), 1);
        let worker = server.modules().get("worker").unwrap();
        assert_eq!(worker.status, ModuleStatus::Stopped);
        assert_eq!(worker.last_error.as_deref(), Some("forced shutdown"));

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn restart_cycles_through_states() -> anyhow::Result<()> {
        let root = unique_test_root("restart");
        tokio::fs::create_dir_all(&root).await?;
        let server = Server::new(config(&root), ModuleFactoryRegistry::new());
        let protocol = Arc::new(FakeProtocol::default());
        *protocol.bus.lock() = Some(server.bus().clone());
        server.add_protocol(protocol.clone());

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        server.bus().on(names::SERVER_STATUS, move |event| {
            if let EventPayload::Custom(value) = &event.payload
                && let Some(status) = value["status"].as_str()
            {
                sink.lock().push(status.to_owned());
            }
            Ok(())
        });

        server.start().await?;
        assert_eq!(server.bound_port("fake"), Some(40_123));
        server.restart().await?;
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(protocol.stops.load(Ordering::SeqCst), 1);

        let snapshot = server.snapshot();
        assert_eq!(snapshot.protocols[0].status, ProtocolStatus::Running);
        assert!(snapshot.started_at.is_some());

        server.stop(StopOptions::forced()).await?;
        assert_eq!(protocol.force_stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            *transitions.lock(),
            vec![
                "starting", "running", "stopping", "stopped", "starting", "running", "stopping",
                "stopped"
            ]
        );
        assert!(server.stop(StopOptions::default()).await.is_ok());

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_module_start_leaves_server_in_error() -> anyhow::Result<()> {
        struct Broken;

        #[async_trait]
        impl ModuleHooks for Broken {
            async fn start(&self, _context: &ModuleContext) -> anyhow::Result<()> {
                anyhow::bail!("missing database url")
            }
        }

        let root = unique_test_root("error");
        write_module(&root, "broken").await?;
        let factories = ModuleFactoryRegistry::new();
        factories.register("broken", |_| Ok(Arc::new(Broken) as Arc<dyn ModuleHooks>));
        let server = Server::new(config(&root), factories);

        let error = server.start().await.unwrap_err();
        assert!(matches!(error, RuntimeError::ModuleStartFailure { .. }));
        assert_eq!(server.status(), ServerStatus::Error);
        assert_eq!(
            server.modules().get("broken").unwrap().status,
            ModuleStatus::Error
        );

        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    /// Registers `GET /flaky`, then fails its first start.
    struct Flaky {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModuleHooks for Flaky {
        async fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
            context
                .register_endpoints(vec![EndpointDefinition::new(Method::Get, "/flaky", "flaky.get")])
                .await?;
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("warming up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_start_withdraws_routes_and_retry_succeeds() -> anyhow::Result<()> {
        let root = unique_test_root("flaky");
        write_module(&root, "flaky").await?;
        let attempts = Arc::new(AtomicUsize::new(0));
        let factories = ModuleFactoryRegistry::new();
        let counter = Arc::clone(&attempts);
        factories.register("flaky", move |_| {
            Ok(Arc::new(Flaky {
                attempts: Arc::clone(&counter),
            }) as Arc<dyn ModuleHooks>)
        });
        let server = Server::new(config(&root), factories);

        assert!(server.start().await.is_err());
        assert_eq!(server.status(), ServerStatus::Error);
        assert!(server.endpoints().is_empty());

        server.start().await?;
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(server.endpoints().len(), 1);
        assert_eq!(
            server.modules().get("flaky").unwrap().status,
            ModuleStatus::Running
        );

        server.stop(StopOptions::default()).await?;
        let _ = tokio::fs::remove_dir_all(&root).await;
        Ok(())
    }

    #[test]
    fn core_handles_are_registered_as_services() {
        let server = Server::new(ServerConfig::default(), ModuleFactoryRegistry::new());
        assert!(server.services().get::<EventBus>("bus").is_some());
        assert!(server.services().get::<EndpointRegistry>("endpoints").is_some());
        assert!(server.services().get::<ModuleBridge>("bridge").is_some());
    }
}
