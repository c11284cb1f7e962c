//! Well-known bus event names.

use crate::ids::RequestId;

pub const REGISTER_ENDPOINTS: &str = "endpoints.register";
pub const MODULE_SHUTDOWN: &str = "module.shutdown";
pub const PORT_BOUND: &str = "server.port_bound";

pub const REQUEST_RECEIVED: &str = "request.received";
pub const REQUEST_COMPLETED: &str = "request.completed";
pub const REQUEST_METRICS: &str = "request.metrics";

pub const AUTH_VALIDATE: &str = "auth.validate";
pub const AUTH_CHECK_ROLES: &str = "auth.check.roles";
pub const AUTH_SESSION_EXTRACT: &str = "auth.session.extract";

pub const SERVER_STATUS: &str = "server.status";

/// Private channel a streaming handler publishes chunks on.
pub fn stream_channel(request_id: &RequestId) -> String {
    format!("stream.{request_id}")
}

/// Extraction event for a named auth strategy.
pub fn auth_strategy_extract(strategy: &str) -> String {
    format!("auth.strategy.{strategy}.extract")
}

pub fn bridge_middleware(phase: &str) -> String {
    format!("bridge.middleware.{phase}")
}

/// `module.<kind>`, where kind is e.g. `status_changed`.
pub fn module_event(kind: &str) -> String {
    format!("module.{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names() {
        let id = RequestId::from_string("abc");
        assert_eq!(stream_channel(&id), "stream.abc");
        assert_eq!(auth_strategy_extract("github"), "auth.strategy.github.extract");
        assert_eq!(bridge_middleware("auth.extract"), "bridge.middleware.auth.extract");
        assert_eq!(module_event("discovered"), "module.discovered");
    }
}
