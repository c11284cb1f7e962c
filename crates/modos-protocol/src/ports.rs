//! Runtime boundary ports.
//!
//! Traits use `async-trait` for dyn dispatch; the server core holds
//! protocol handlers as `Arc<dyn ProtocolHandler>`.

use async_trait::async_trait;

use crate::error::RuntimeResult;
use crate::server::ProtocolStatus;

/// One wire protocol terminated by the server core.
///
/// `initialize` is safe to call more than once. `stop` is the graceful path;
/// `force_stop` must not wait on in-flight work.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> ProtocolStatus;

    /// Port actually bound, once running.
    fn bound_port(&self) -> Option<u16> {
        None
    }

    async fn initialize(&self) -> RuntimeResult<()>;

    async fn start(&self) -> RuntimeResult<()>;

    async fn stop(&self) -> RuntimeResult<()>;

    async fn force_stop(&self);
}
