//! Bus payload taxonomy.
//!
//! Every bus event carries one [`EventPayload`] variant. Consumers match on
//! the variant they expect and treat anything else as a protocol violation,
//! so there is no runtime shape-guessing on untyped maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::EndpointDefinition;
use crate::ids::{ModuleId, RequestId};
use crate::module::ModuleEvent;
use crate::request::{AuthContext, CanonicalRequest, CanonicalResponse, Method};

/// Discriminated union of everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Empty,
    Request(Box<CanonicalRequest>),
    Response(CanonicalResponse),
    StreamChunk(StreamChunk),
    RegisterEndpoints(RegisterEndpoints),
    ModuleShutdown(ModuleShutdown),
    PortBound(PortBound),
    RequestLifecycle(RequestLifecycle),
    RequestMetrics(RequestMetrics),
    ValidateCredential(ValidateCredential),
    AuthValidation(AuthValidation),
    RoleCheck(RoleCheck),
    RoleCheckResult(RoleCheckResult),
    ExtractIdentity(ExtractIdentity),
    IdentityExtraction(IdentityExtraction),
    Middleware(Box<MiddlewareContext>),
    MiddlewareDecision(MiddlewareDecision),
    Module(ModuleEvent),
    Custom(Value),
}

impl EventPayload {
    /// Variant name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::StreamChunk(_) => "stream_chunk",
            Self::RegisterEndpoints(_) => "register_endpoints",
            Self::ModuleShutdown(_) => "module_shutdown",
            Self::PortBound(_) => "port_bound",
            Self::RequestLifecycle(_) => "request_lifecycle",
            Self::RequestMetrics(_) => "request_metrics",
            Self::ValidateCredential(_) => "validate_credential",
            Self::AuthValidation(_) => "auth_validation",
            Self::RoleCheck(_) => "role_check",
            Self::RoleCheckResult(_) => "role_check_result",
            Self::ExtractIdentity(_) => "extract_identity",
            Self::IdentityExtraction(_) => "identity_extraction",
            Self::Middleware(_) => "middleware",
            Self::MiddlewareDecision(_) => "middleware_decision",
            Self::Module(_) => "module",
            Self::Custom(_) => "custom",
        }
    }
}

/// One piece of a streaming reply, published on `stream.<requestId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub done: bool,
}

impl StreamChunk {
    pub fn data(data: Value) -> Self {
        Self { data, done: false }
    }

    pub fn done() -> Self {
        Self {
            data: Value::Null,
            done: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterEndpoints {
    pub module_id: ModuleId,
    pub endpoints: Vec<EndpointDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleShutdown {
    pub module_id: ModuleId,
}

/// A protocol bound its listener; reports the real port when `0` was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBound {
    pub protocol: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Received,
    Completed,
}

/// Interceptable notice that a transport request entered or left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLifecycle {
    pub request_id: RequestId,
    pub phase: LifecyclePhase,
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub protocol: String,
}

/// Emitted once per request regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetrics {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
    pub duration_ms: f64,
    pub success: bool,
    pub status_code: u16,
    pub protocol: String,
}

/// Query for `auth.validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCredential {
    pub token: String,
    pub request_id: RequestId,
}

/// Reply to `auth.validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Query for `auth.check.roles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCheck {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCheckResult {
    pub has_roles: bool,
}

/// Query for session or strategy based identity extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractIdentity {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityExtraction {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IdentityExtraction {
    pub fn into_auth_context(self, strategy: Option<String>) -> AuthContext {
        AuthContext {
            user_id: self.user_id,
            session_id: self.session_id,
            scopes: self.scopes,
            strategy,
        }
    }
}

/// Named phases of the bridge middleware pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewarePhase {
    Request,
    AuthExtract,
    AuthValidate,
    AuthAuthorize,
    Response,
}

impl MiddlewarePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::AuthExtract => "auth.extract",
            Self::AuthValidate => "auth.validate",
            Self::AuthAuthorize => "auth.authorize",
            Self::Response => "response",
        }
    }
}

/// What a middleware hook sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareContext {
    pub phase: MiddlewarePhase,
    pub request: CanonicalRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CanonicalResponse>,
}

/// A middleware hook's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MiddlewareDecision {
    Continue,
    /// Continue and attach an established identity to the request.
    Authenticated(AuthContext),
    Reject {
        status_code: u16,
        message: String,
    },
}
