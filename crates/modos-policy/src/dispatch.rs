//! Request id assignment, handler dispatch, and call accounting shared by
//! every protocol handler and the module bridge.

use std::time::Duration;

use modos_endpoints::EndpointRegistry;
use modos_events::{EventBus, RequestIdClaim};
use modos_protocol::{
    CanonicalRequest, CanonicalResponse, Endpoint, EventPayload, RequestId, RequestMetrics,
    RuntimeError, names,
};
use tracing::{debug, instrument, warn};

/// Claim a request id for one call.
///
/// An inbound id is reused only when it is a well-formed UUID that no other
/// call currently holds; otherwise a fresh UUID is claimed.
pub fn assign_request_id(bus: &EventBus, hint: Option<&str>) -> RequestIdClaim {
    if let Some(claim) = hint
        .and_then(RequestId::parse_hint)
        .and_then(|id| bus.claim_request_id(id))
    {
        return claim;
    }
    loop {
        if let Some(claim) = bus.claim_request_id(RequestId::new_uuid()) {
            return claim;
        }
    }
}

/// Correlated call against the route's handler event with the route timeout.
#[instrument(skip_all, fields(request_id = %request.request_id, handler = %endpoint.handler()))]
pub async fn dispatch_unary(
    bus: &EventBus,
    endpoint: &Endpoint,
    request: CanonicalRequest,
) -> CanonicalResponse {
    let request_id = request.request_id.clone();
    let timeout = Duration::from_millis(endpoint.definition.timeout_ms);
    let reply = bus
        .request(
            endpoint.handler(),
            request_id,
            EventPayload::Request(Box::new(request)),
            timeout,
        )
        .await;
    match reply {
        Ok(EventPayload::Response(response)) => response,
        Ok(other) => {
            warn!(payload = other.kind(), "handler replied without a response");
            RuntimeError::Internal(format!("unexpected {} reply", other.kind())).into()
        }
        Err(error @ (RuntimeError::Timeout { .. } | RuntimeError::HandlerNotFound(_))) => {
            debug!(error = %error, "dispatch failed");
            error.into()
        }
        Err(error) => {
            warn!(error = %error, "dispatch failed");
            RuntimeError::internal(error).into()
        }
    }
}

/// Everything needed to account for one finished call.
#[derive(Debug, Clone)]
pub struct CallSummary<'a> {
    pub request_id: &'a RequestId,
    pub endpoint: Option<&'a Endpoint>,
    pub status_code: u16,
    pub elapsed: Duration,
    pub protocol: &'a str,
}

impl CallSummary<'_> {
    pub fn success(&self) -> bool {
        self.status_code < 400
    }

    fn duration_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }
}

/// Fold the call into route stats and publish `request.metrics`.
pub fn record_call(bus: &EventBus, endpoints: &EndpointRegistry, summary: &CallSummary<'_>) {
    let success = summary.success();
    let duration_ms = summary.duration_ms();
    if let Some(endpoint) = summary.endpoint {
        endpoints.update_stats(endpoint.method(), &endpoint.pattern, success, duration_ms);
    }
    bus.emit(
        names::REQUEST_METRICS,
        EventPayload::RequestMetrics(RequestMetrics {
            request_id: summary.request_id.clone(),
            route: summary.endpoint.map(Endpoint::route_key),
            module_id: summary.endpoint.map(|endpoint| endpoint.module_id.clone()),
            duration_ms,
            success,
            status_code: summary.status_code,
            protocol: summary.protocol.to_owned(),
        }),
    );
}
