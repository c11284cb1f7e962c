//! Transport-free dispatch through the endpoint registry and the bus.
//!
//! The bridge runs the same route, auth, validation, rate-limit, and dispatch
//! steps as a protocol handler, wrapped in middleware phases that
//! collaborators answer on `bridge.middleware.<phase>`. A phase that gets no
//! decision within the grace window continues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use modos_endpoints::EndpointRegistry;
use modos_events::{EventBus, StreamSubscription};
use modos_policy::{CallSummary, RoutePolicy, assign_request_id, dispatch_unary, record_call};
use modos_protocol::{
    CanonicalRequest, CanonicalResponse, Endpoint, ErrorBody, EventPayload, InboundRequest,
    MiddlewareContext, MiddlewareDecision, MiddlewarePhase, RequestId, RuntimeError,
    RuntimeResult, names,
};
use serde_json::Value;
use tracing::{debug, instrument, warn};

pub const BRIDGE_PROTOCOL: &str = "bridge";

#[derive(Debug, Clone)]
pub struct ModuleBridge {
    bus: EventBus,
    endpoints: Arc<EndpointRegistry>,
    policy: RoutePolicy,
    grace: Duration,
}

/// Result of one phase: carry on, or stop with this response.
enum Phase {
    Continue,
    Stop(CanonicalResponse),
}

impl ModuleBridge {
    pub fn new(
        bus: EventBus,
        endpoints: Arc<EndpointRegistry>,
        policy: RoutePolicy,
        grace: Duration,
    ) -> Self {
        Self {
            bus,
            endpoints,
            policy,
            grace,
        }
    }

    /// Dispatch one request and return exactly one response.
    ///
    /// Streaming routes are collected until their `done` chunk or the route
    /// timeout; the chunk data is returned as an array.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn dispatch(&self, request: InboundRequest) -> CanonicalResponse {
        let started = Instant::now();
        let claim = assign_request_id(&self.bus, request.request_id.as_ref().map(|id| id.as_str()));
        let request_id = claim.id().clone();
        let Some(route) = self.endpoints.match_endpoint(request.method, &request.path) else {
            let response = CanonicalResponse::from_error(&RuntimeError::RouteNotFound {
                method: request.method.to_string(),
                path: request.path.clone(),
            });
            self.finish(&request_id, None, &response, started);
            return response;
        };

        let endpoint = Arc::clone(&route.endpoint);
        let response = self.run(request, request_id.clone(), route.endpoint, route.params).await;
        self.finish(&request_id, Some(endpoint.as_ref()), &response, started);
        response
    }

    /// Subscribe to a streaming route's chunks and publish the request.
    ///
    /// The subscription is attached before the request is published so no
    /// chunk is missed. Policy failures are returned as errors.
    pub async fn open_stream(&self, mut request: InboundRequest) -> RuntimeResult<StreamSubscription> {
        let claim = assign_request_id(&self.bus, request.request_id.as_ref().map(|id| id.as_str()));
        let request_id = claim.id().clone();
        let route = self
            .endpoints
            .match_endpoint(request.method, &request.path)
            .ok_or_else(|| RuntimeError::RouteNotFound {
                method: request.method.to_string(),
                path: request.path.clone(),
            })?;
        if !route.endpoint.definition.streaming {
            return Err(RuntimeError::Validation(format!(
                "{} is not a streaming route",
                route.endpoint.route_key()
            )));
        }
        self.policy
            .enforce(&route.endpoint, &mut request, &route.params, &request_id)
            .await?;
        let canonical = canonical_request(request, request_id, &route.endpoint, route.params);
        Ok(self
            .publish_stream_request(&route.endpoint, canonical)?
            .hold(claim))
    }

    async fn run(
        &self,
        mut request: InboundRequest,
        request_id: RequestId,
        endpoint: Arc<Endpoint>,
        params: BTreeMap<String, String>,
    ) -> CanonicalResponse {
        let mut canonical = canonical_request(request.clone(), request_id.clone(), &endpoint, params.clone());

        if let Phase::Stop(response) = self.phase(MiddlewarePhase::Request, &mut canonical, None).await {
            return response;
        }

        if endpoint.definition.auth.required {
            for phase in [MiddlewarePhase::AuthExtract, MiddlewarePhase::AuthValidate] {
                if let Phase::Stop(response) = self.phase(phase, &mut canonical, None).await {
                    return response;
                }
            }
            request.auth = canonical.auth.clone();
            match self.policy.authenticate(&endpoint, &request, &request_id).await {
                Ok(Some(context)) => {
                    request.auth = Some(context.clone());
                    canonical.auth = Some(context);
                }
                Ok(None) => {}
                Err(error) => return error.into(),
            }
            if let Phase::Stop(response) = self
                .phase(MiddlewarePhase::AuthAuthorize, &mut canonical, None)
                .await
            {
                return response;
            }
        }

        if let Err(error) = self
            .policy
            .validate(&endpoint, &request, &params)
            .and_then(|()| self.policy.rate_limit(&endpoint, &request))
        {
            return error.into();
        }

        let response = if endpoint.definition.streaming {
            self.collect_stream(&endpoint, canonical.clone()).await
        } else {
            dispatch_unary(&self.bus, &endpoint, canonical.clone()).await
        };

        match self
            .phase(MiddlewarePhase::Response, &mut canonical, Some(&response))
            .await
        {
            Phase::Stop(replacement) => replacement,
            Phase::Continue => response,
        }
    }

    async fn phase(
        &self,
        phase: MiddlewarePhase,
        request: &mut CanonicalRequest,
        response: Option<&CanonicalResponse>,
    ) -> Phase {
        let event = names::bridge_middleware(phase.as_str());
        if !self.bus.has_listeners(&event) {
            return Phase::Continue;
        }
        let payload = EventPayload::Middleware(Box::new(MiddlewareContext {
            phase,
            request: request.clone(),
            response: response.cloned(),
        }));
        match self.bus.emit_and_wait(&event, payload, self.grace).await {
            Ok(EventPayload::MiddlewareDecision(MiddlewareDecision::Continue)) => Phase::Continue,
            Ok(EventPayload::MiddlewareDecision(MiddlewareDecision::Authenticated(context))) => {
                debug!(phase = phase.as_str(), "middleware attached identity");
                request.auth = Some(context);
                Phase::Continue
            }
            Ok(EventPayload::MiddlewareDecision(MiddlewareDecision::Reject {
                status_code,
                message,
            })) => {
                debug!(phase = phase.as_str(), status_code, "middleware rejected request");
                Phase::Stop(rejection(status_code, message))
            }
            Ok(other) => {
                warn!(phase = phase.as_str(), payload = other.kind(), "unexpected middleware reply");
                Phase::Continue
            }
            Err(error) => {
                debug!(phase = phase.as_str(), error = %error, "no middleware decision, continuing");
                Phase::Continue
            }
        }
    }

    fn publish_stream_request(
        &self,
        endpoint: &Endpoint,
        canonical: CanonicalRequest,
    ) -> RuntimeResult<StreamSubscription> {
        let subscription = self.bus.stream(&canonical.request_id);
        let reached = self
            .bus
            .emit(endpoint.handler(), EventPayload::Request(Box::new(canonical)));
        if reached == 0 {
            return Err(RuntimeError::HandlerNotFound(endpoint.handler().to_owned()));
        }
        Ok(subscription)
    }

    async fn collect_stream(&self, endpoint: &Endpoint, canonical: CanonicalRequest) -> CanonicalResponse {
        let mut subscription = match self.publish_stream_request(endpoint, canonical) {
            Ok(subscription) => subscription,
            Err(error) => return error.into(),
        };
        let timeout = Duration::from_millis(endpoint.definition.timeout_ms);
        let collect = async {
            let mut chunks = Vec::new();
            while let Some(chunk) = subscription.next().await {
                if chunk.done {
                    break;
                }
                chunks.push(chunk.data);
            }
            chunks
        };
        match tokio::time::timeout(timeout, collect).await {
            Ok(chunks) => CanonicalResponse::ok(Value::Array(chunks)),
            Err(_) => RuntimeError::Timeout {
                event: endpoint.handler().to_owned(),
                timeout_ms: endpoint.definition.timeout_ms,
            }
            .into(),
        }
    }

    fn finish(
        &self,
        request_id: &RequestId,
        endpoint: Option<&Endpoint>,
        response: &CanonicalResponse,
        started: Instant,
    ) {
        record_call(
            &self.bus,
            &self.endpoints,
            &CallSummary {
                request_id,
                endpoint,
                status_code: response.status_code(),
                elapsed: started.elapsed(),
                protocol: BRIDGE_PROTOCOL,
            },
        );
    }
}

fn canonical_request(
    request: InboundRequest,
    request_id: RequestId,
    endpoint: &Endpoint,
    params: BTreeMap<String, String>,
) -> CanonicalRequest {
    CanonicalRequest::from_inbound(
        request,
        request_id,
        endpoint.module_id.clone(),
        endpoint.handler(),
        params,
        BRIDGE_PROTOCOL,
    )
}

fn rejection(status_code: u16, message: String) -> CanonicalResponse {
    let code = match status_code {
        401 => "AUTHENTICATION_ERROR",
        403 => "AUTHORIZATION_ERROR",
        429 => "RATE_LIMITED",
        _ => "MIDDLEWARE_REJECTED",
    };
    CanonicalResponse::Error {
        error: ErrorBody::new(code, message, status_code),
    }
}
