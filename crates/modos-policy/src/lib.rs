//! Route policy for modos protocol handlers and the module bridge.
//!
//! - [`credentials`] — bearer extraction from header, cookie, and query
//! - [`auth`] — identity establishment and authorization over the bus
//! - [`validation`] — structural body/query/params checks
//! - [`rate_limit`] — fixed-window limiter per (route, client)
//! - [`dispatch`] — request ids, handler dispatch, call accounting
//!
//! [`RoutePolicy`] runs the three checks in pipeline order.

pub mod auth;
pub mod credentials;
pub mod dispatch;
pub mod rate_limit;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;

use modos_events::EventBus;
use modos_protocol::{AuthContext, Endpoint, InboundRequest, RequestId, RuntimeResult};

pub use auth::{AuthTimeouts, Authenticator};
pub use credentials::{Credential, CredentialSource, extract_credential, parse_cookies};
pub use dispatch::{CallSummary, assign_request_id, dispatch_unary, record_call};
pub use rate_limit::FixedWindowLimiter;
pub use validation::validate_request;

/// Auth, validation, and rate limiting for one resolved route.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    authenticator: Authenticator,
    limiter: Arc<FixedWindowLimiter>,
}

impl RoutePolicy {
    pub fn new(bus: EventBus, timeouts: AuthTimeouts) -> Self {
        Self {
            authenticator: Authenticator::new(bus, timeouts),
            limiter: Arc::new(FixedWindowLimiter::new()),
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn limiter(&self) -> &Arc<FixedWindowLimiter> {
        &self.limiter
    }

    pub async fn authenticate(
        &self,
        endpoint: &Endpoint,
        request: &InboundRequest,
        request_id: &RequestId,
    ) -> RuntimeResult<Option<AuthContext>> {
        self.authenticator
            .authenticate(request, request_id, &endpoint.definition.auth)
            .await
    }

    pub fn validate(
        &self,
        endpoint: &Endpoint,
        request: &InboundRequest,
        params: &BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        match &endpoint.definition.validation {
            Some(schema) => validate_request(schema, request.body.as_ref(), &request.query, params),
            None => Ok(()),
        }
    }

    /// Counts against the window keyed by route and [`InboundRequest::client_identity`].
    pub fn rate_limit(&self, endpoint: &Endpoint, request: &InboundRequest) -> RuntimeResult<()> {
        match endpoint.definition.rate_limit {
            Some(spec) => self
                .limiter
                .check(&endpoint.route_key(), &request.client_identity(), spec),
            None => Ok(()),
        }
    }

    /// Steps 3–5 of the request pipeline. Attaches the established identity
    /// to `request` so rate limiting keys on the user when known.
    pub async fn enforce(
        &self,
        endpoint: &Endpoint,
        request: &mut InboundRequest,
        params: &BTreeMap<String, String>,
        request_id: &RequestId,
    ) -> RuntimeResult<()> {
        if let Some(context) = self.authenticate(endpoint, request, request_id).await? {
            request.auth = Some(context);
        }
        self.validate(endpoint, request, params)?;
        self.rate_limit(endpoint, request)
    }
}
