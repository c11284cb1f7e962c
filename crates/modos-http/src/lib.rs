//! # modos-http — HTTP/SSE protocol handler
//!
//! - [`pipeline`] — the axum router and the per-request pipeline
//! - [`inbound`] — HTTP request decoding
//!
//! [`HttpProtocolHandler`] plugs the router into the server core through
//! [`ProtocolHandler`].

pub mod inbound;
pub mod pipeline;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use modos_endpoints::EndpointRegistry;
use modos_events::EventBus;
use modos_policy::RoutePolicy;
use modos_protocol::{
    EventPayload, PortBound, ProtocolHandler, ProtocolStatus, RuntimeError, RuntimeResult, names,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub use pipeline::{HEALTH_PATH, HTTP_PROTOCOL, HttpState, REQUEST_ID_HEADER, router};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: String,
    /// `0` binds an OS-assigned port, announced with `PortBound`.
    pub port: u16,
    /// How long `stop` waits for open connections before aborting.
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8787,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Aborts the server task when dropped, including when a drain is abandoned.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct HttpProtocolHandler {
    config: HttpConfig,
    state: HttpState,
    status: Mutex<ProtocolStatus>,
    router: Mutex<Option<Router>>,
    running: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for HttpProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocolHandler")
            .field("config", &self.config)
            .field("status", &*self.status.lock())
            .field("local_addr", &*self.local_addr.lock())
            .finish()
    }
}

impl HttpProtocolHandler {
    pub fn new(
        config: HttpConfig,
        bus: EventBus,
        endpoints: Arc<EndpointRegistry>,
        policy: RoutePolicy,
    ) -> Self {
        Self {
            config,
            state: HttpState::new(bus, endpoints, policy),
            status: Mutex::new(ProtocolStatus::Initialized),
            router: Mutex::new(None),
            running: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn app(&self) -> Router {
        self.router
            .lock()
            .get_or_insert_with(|| router(self.state.clone()))
            .clone()
    }

    fn finish_stop(&self) {
        *self.local_addr.lock() = None;
        *self.status.lock() = ProtocolStatus::Stopped;
    }
}

#[async_trait]
impl ProtocolHandler for HttpProtocolHandler {
    fn name(&self) -> &str {
        HTTP_PROTOCOL
    }

    fn status(&self) -> ProtocolStatus {
        *self.status.lock()
    }

    fn bound_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    async fn initialize(&self) -> RuntimeResult<()> {
        let _ = self.app();
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn start(&self) -> RuntimeResult<()> {
        if self.running.lock().is_some() {
            return Ok(());
        }
        let app = self.app();
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|error| {
                RuntimeError::Internal(format!(
                    "failed to bind {}:{}: {error}",
                    self.config.host, self.config.port
                ))
            })?;
        let addr = listener.local_addr().map_err(RuntimeError::internal)?;

        self.state.open_streams();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = signal.await;
            })
            .await;
            if let Err(error) = served {
                warn!(error = %error, "http server exited with error");
            }
        });

        *self.running.lock() = Some(Running { shutdown, task });
        *self.local_addr.lock() = Some(addr);
        *self.status.lock() = ProtocolStatus::Running;
        self.state.bus.emit(
            names::PORT_BOUND,
            EventPayload::PortBound(PortBound {
                protocol: HTTP_PROTOCOL.to_owned(),
                address: addr.ip().to_string(),
                port: addr.port(),
            }),
        );
        info!(addr = %addr, "http listening");
        Ok(())
    }

    /// Stop accepting, give open connections the drain window, then close
    /// open streams and abort.
    ///
    /// Dropping the returned future mid-drain aborts the server task; a
    /// following `force_stop` closes whatever streams are still open.
    #[instrument(skip(self))]
    async fn stop(&self) -> RuntimeResult<()> {
        let running = self.running.lock().take();
        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(());
            let mut task = AbortOnDrop(task);
            if tokio::time::timeout(self.config.drain_timeout, &mut task.0)
                .await
                .is_err()
            {
                warn!(
                    drain_ms = self.config.drain_timeout.as_millis() as u64,
                    "connections still open, aborting http server"
                );
                self.state.close_streams();
            }
        }
        self.finish_stop();
        info!("http stopped");
        Ok(())
    }

    async fn force_stop(&self) {
        if let Some(Running { shutdown, task }) = self.running.lock().take() {
            let _ = shutdown.send(());
            task.abort();
        }
        self.state.close_streams();
        self.finish_stop();
        warn!("http force-stopped");
    }
}
