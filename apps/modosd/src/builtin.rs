//! Modules linked into the daemon.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modos_endpoints::EndpointRegistry;
use modos_events::{BusEvent, EventBus, ListenerId};
use modos_kernel::Server;
use modos_modules::{ModuleContext, ModuleFactoryRegistry, ModuleHooks, ModuleRegistry};
use modos_protocol::{
    CanonicalResponse, EndpointDefinition, EventPayload, Method, Module, ModuleHealth, ModuleStatus,
    ModuleType, StreamChunk, names,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

pub const ECHO: &str = "echo";
pub const SYSTEM: &str = "system";

const MAX_ECHO_CHUNKS: u64 = 100;

/// Register the built-in factories and their module records on `server`.
pub fn install(server: &Server, factories: &ModuleFactoryRegistry) {
    factories.register(ECHO, |_| Ok(Arc::new(EchoModule::default()) as Arc<dyn ModuleHooks>));

    let endpoints = Arc::clone(server.endpoints());
    let modules = Arc::clone(server.modules());
    factories.register(SYSTEM, move |_| {
        Ok(Arc::new(SystemModule::new(Arc::clone(&endpoints), Arc::clone(&modules)))
            as Arc<dyn ModuleHooks>)
    });

    for module in builtin_modules() {
        if !server.modules().contains(module.name.as_str()) {
            server.modules().upsert_discovered(module);
        }
    }
}

/// Registry records for the modules compiled into the daemon.
pub fn builtin_modules() -> Vec<Module> {
    let version = env!("CARGO_PKG_VERSION");
    [(SYSTEM, ModuleType::Core), (ECHO, ModuleType::Service)]
        .into_iter()
        .map(|(name, module_type)| {
            let mut module = Module::new(name, version, module_type, format!("builtin:{name}"));
            module.description = Some(format!("built-in {name} module"));
            module
        })
        .collect()
}

/// Bus listeners a module holds while running.
#[derive(Default)]
struct Subscriptions(Mutex<Vec<(String, ListenerId)>>);

impl Subscriptions {
    fn on<F>(&self, bus: &EventBus, name: &str, listener: F)
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = bus.on(name, listener);
        self.0.lock().push((name.to_owned(), id));
    }

    fn release(&self, bus: &EventBus) {
        for (name, id) in self.0.lock().drain(..) {
            bus.off(&name, id);
        }
    }
}

fn reply(event: &BusEvent, response: CanonicalResponse) {
    if !event.reply(EventPayload::Response(response)) {
        debug!(event = %event.name, "reply arrived after the caller gave up");
    }
}

/// `POST /echo` answers with what it was sent; `GET /echo/stream` streams
/// `count` numbered chunks.
#[derive(Default)]
pub struct EchoModule {
    subscriptions: Subscriptions,
}

#[async_trait]
impl ModuleHooks for EchoModule {
    async fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.subscriptions.on(&context.bus, "echo.reply", |event| {
            if let Some(request) = event.canonical_request() {
                reply(
                    event,
                    CanonicalResponse::ok(json!({
                        "method": request.method,
                        "path": request.path,
                        "query": request.query,
                        "body": request.body,
                    })),
                );
            }
            Ok(())
        });

        let publisher = context.bus.clone();
        self.subscriptions.on(&context.bus, "echo.stream", move |event| {
            let Some(request) = event.canonical_request() else {
                return Ok(());
            };
            let count = request
                .query
                .get("count")
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(3)
                .min(MAX_ECHO_CHUNKS);
            let channel = names::stream_channel(&request.request_id);
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for index in 0..count {
                    publisher.emit(
                        &channel,
                        EventPayload::StreamChunk(StreamChunk::data(json!({ "index": index }))),
                    );
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                publisher.emit(&channel, EventPayload::StreamChunk(StreamChunk::done()));
            });
            Ok(())
        });

        context
            .register_endpoints(vec![
                EndpointDefinition::new(Method::Post, "/echo", "echo.reply")
                    .with_description("Echo the request back"),
                EndpointDefinition::new(Method::Get, "/echo/stream", "echo.stream")
                    .streaming()
                    .with_description("Stream numbered chunks"),
            ])
            .await?;
        Ok(())
    }

    async fn stop(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.subscriptions.release(&context.bus);
        Ok(())
    }
}

/// Read-only views of the running server under `/system`.
pub struct SystemModule {
    endpoints: Arc<EndpointRegistry>,
    modules: Arc<ModuleRegistry>,
    subscriptions: Subscriptions,
}

impl SystemModule {
    pub fn new(endpoints: Arc<EndpointRegistry>, modules: Arc<ModuleRegistry>) -> Self {
        Self {
            endpoints,
            modules,
            subscriptions: Subscriptions::default(),
        }
    }
}

fn module_summary(module: &Module) -> Value {
    json!({
        "name": module.name,
        "version": module.version,
        "type": module.module_type,
        "status": module.status,
        "health": module.health,
    })
}

#[async_trait]
impl ModuleHooks for SystemModule {
    async fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        let bus = &context.bus;

        let modules = Arc::clone(&self.modules);
        self.subscriptions.on(bus, "system.health", move |event| {
            let running = modules
                .list()
                .iter()
                .filter(|module| module.status == ModuleStatus::Running)
                .count();
            reply(event, CanonicalResponse::ok(json!({ "status": "ok", "runningModules": running })));
            Ok(())
        });

        let modules = Arc::clone(&self.modules);
        self.subscriptions.on(bus, "system.modules.list", move |event| {
            let listed: Vec<Value> = modules.list().iter().map(module_summary).collect();
            reply(event, CanonicalResponse::ok(Value::Array(listed)));
            Ok(())
        });

        let modules = Arc::clone(&self.modules);
        self.subscriptions.on(bus, "system.modules.get", move |event| {
            let Some(request) = event.canonical_request() else {
                return Ok(());
            };
            let name = request.params.get("name").map(String::as_str).unwrap_or_default();
            let response = match modules.require(name) {
                Ok(module) => CanonicalResponse::ok(serde_json::to_value(&module)?),
                Err(error) => CanonicalResponse::from_error(&error),
            };
            reply(event, response);
            Ok(())
        });

        let endpoints = Arc::clone(&self.endpoints);
        self.subscriptions.on(bus, "system.endpoints", move |event| {
            let stats = endpoints.all_stats();
            let listed: Vec<Value> = endpoints
                .list_endpoints()
                .iter()
                .map(|endpoint| {
                    let route = endpoint.route_key();
                    json!({
                        "stats": stats.get(&route).cloned().unwrap_or_default(),
                        "route": route,
                        "module": endpoint.module_id,
                        "handler": endpoint.handler(),
                        "streaming": endpoint.definition.streaming,
                    })
                })
                .collect();
            reply(event, CanonicalResponse::ok(Value::Array(listed)));
            Ok(())
        });

        context
            .register_endpoints(vec![
                EndpointDefinition::new(Method::Get, "/system/health", "system.health"),
                EndpointDefinition::new(Method::Get, "/system/modules", "system.modules.list"),
                EndpointDefinition::new(Method::Get, "/system/modules/:name", "system.modules.get"),
                EndpointDefinition::new(Method::Get, "/system/endpoints", "system.endpoints"),
            ])
            .await?;
        Ok(())
    }

    async fn stop(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.subscriptions.release(&context.bus);
        Ok(())
    }

    async fn health(&self, _context: &ModuleContext) -> ModuleHealth {
        if self.endpoints.is_empty() {
            return ModuleHealth::unhealthy("no routes registered");
        }
        ModuleHealth::healthy(format!("serving {} routes", self.endpoints.len()))
    }
}
