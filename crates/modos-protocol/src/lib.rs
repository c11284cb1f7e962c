//! # modos-protocol — Canonical server-core contract
//!
//! Shared types, the bus payload taxonomy, event names, and the error
//! taxonomy that every modos crate depends on.
//!
//! It is intentionally dependency-light (no tokio, no axum) so it can be used
//! as a pure contract crate by protocol handlers and modules alike.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (RequestId, ModuleId)
//! - [`request`] — InboundRequest, CanonicalRequest, CanonicalResponse
//! - [`endpoint`] — EndpointDefinition, auth/validation/rate-limit policy, stats
//! - [`module`] — Module records, manifests, lifecycle states, module events
//! - [`event`] — EventPayload tagged union and the payload structs
//! - [`names`] — Well-known bus event names
//! - [`server`] — ServerStatus, ProtocolStatus
//! - [`ports`] — ProtocolHandler boundary trait
//! - [`error`] — RuntimeError, RuntimeResult

pub mod endpoint;
pub mod error;
pub mod event;
pub mod ids;
pub mod module;
pub mod names;
pub mod ports;
pub mod request;
pub mod server;

// Re-export the most commonly used types at the crate root.
pub use endpoint::{
    AuthRequirement, DEFAULT_ENDPOINT_TIMEOUT_MS, Endpoint, EndpointDefinition, EndpointStats,
    FieldSchema, FieldType, ObjectSchema, RateLimitSpec, ValidationSchema,
};
pub use error::{ErrorBody, RuntimeError, RuntimeResult};
pub use event::{
    AuthValidation, EventPayload, ExtractIdentity, IdentityExtraction, LifecyclePhase,
    MiddlewareContext, MiddlewareDecision, MiddlewarePhase, ModuleShutdown, PortBound,
    RegisterEndpoints, RequestLifecycle, RequestMetrics, RoleCheck, RoleCheckResult, StreamChunk,
    ValidateCredential,
};
pub use ids::{ModuleId, RequestId};
pub use module::{
    HealthStatus, Module, ModuleCli, ModuleCliCommand, ModuleEvent, ModuleEventKind, ModuleHealth,
    ModuleManifest, ModuleStatus, ModuleType,
};
pub use ports::ProtocolHandler;
pub use request::{
    AuthContext, CanonicalRequest, CanonicalResponse, InboundRequest, Method, Redirect,
};
pub use server::{ProtocolStatus, ServerStatus};
