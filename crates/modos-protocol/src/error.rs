//! Error taxonomy for the server core.
//!
//! Every variant carries a stable machine code (`code()`) and an
//! HTTP-equivalent status (`status_code()`) so protocol handlers can render a
//! terminal response without inspecting messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the bus, registries, pipeline, and lifecycle orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },
    #[error("route {method} {path} is already registered by module {existing_module}")]
    DuplicateRoute {
        method: String,
        path: String,
        existing_module: String,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("timed out after {timeout_ms}ms waiting on {event}")]
    Timeout { event: String, timeout_ms: u64 },
    #[error("no handler registered for {0}")]
    HandlerNotFound(String),
    #[error("circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("module {module} depends on unknown module {dependency}")]
    UnresolvedDependency { module: String, dependency: String },
    #[error("module {module} failed to start: {reason}")]
    ModuleStartFailure { module: String, reason: String },
    #[error("module {module} failed to stop: {reason}")]
    ModuleStopFailure { module: String, reason: String },
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn internal(error: impl std::fmt::Display) -> Self {
        Self::Internal(error.to_string())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::DuplicateRoute { .. } => "DUPLICATE_ROUTE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Authorization(_) => "AUTHORIZATION_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            Self::CircularDependency(_) => "CIRCULAR_DEPENDENCY",
            Self::UnresolvedDependency { .. } => "UNRESOLVED_DEPENDENCY",
            Self::ModuleStartFailure { .. } => "MODULE_START_FAILURE",
            Self::ModuleStopFailure { .. } => "MODULE_STOP_FAILURE",
            Self::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Manifest(_) => "INVALID_MANIFEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP-equivalent status for transport responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } | Self::ModuleNotFound(_) => 404,
            Self::DuplicateRoute { .. } | Self::InvalidTransition { .. } => 409,
            Self::Validation(_) | Self::Manifest(_) => 400,
            Self::Authentication(_) => 401,
            Self::Authorization(_) => 403,
            Self::RateLimited { .. } => 429,
            Self::Timeout { .. } => 504,
            Self::HandlerNotFound(_) => 503,
            Self::CircularDependency(_)
            | Self::UnresolvedDependency { .. }
            | Self::ModuleStartFailure { .. }
            | Self::ModuleStopFailure { .. }
            | Self::Internal(_) => 500,
        }
    }

    /// Message safe to hand to a transport client.
    ///
    /// Internal failures never expose their detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_)
            | Self::ModuleStartFailure { .. }
            | Self::ModuleStopFailure { .. }
            | Self::CircularDependency(_)
            | Self::UnresolvedDependency { .. } => "internal server error".to_owned(),
            Self::Timeout { .. } => "upstream handler timed out".to_owned(),
            other => other.to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.public_message(),
            status_code: self.status_code(),
        }
    }
}

/// Wire shape of `{error: {code, message, statusCode}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub status_code: u16,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status_code,
        }
    }
}

/// Convenience result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
