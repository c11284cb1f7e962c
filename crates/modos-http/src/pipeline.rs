//! The per-request pipeline: request id, routing, auth, validation, rate
//! limiting, dispatch, and accounting.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, LOCATION, RETRY_AFTER, SET_COOKIE};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{FutureExt, StreamExt};
use modos_endpoints::EndpointRegistry;
use modos_events::{EventBus, RequestIdClaim, StreamSubscription};
use modos_policy::{CallSummary, RoutePolicy, assign_request_id, dispatch_unary, record_call};
use modos_protocol::{
    CanonicalRequest, CanonicalResponse, Endpoint, EventPayload, InboundRequest, LifecyclePhase,
    Method, RequestId, RequestLifecycle, RuntimeError, names,
};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::inbound::inbound_from_http;

pub const HTTP_PROTOCOL: &str = "http";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const HEALTH_PATH: &str = "/healthz";

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Everything a request needs, shared by every connection.
#[derive(Debug, Clone)]
pub struct HttpState {
    pub bus: EventBus,
    pub endpoints: Arc<EndpointRegistry>,
    pub policy: RoutePolicy,
    /// `true` ends every open SSE response.
    closing: Arc<watch::Sender<bool>>,
}

impl HttpState {
    pub fn new(bus: EventBus, endpoints: Arc<EndpointRegistry>, policy: RoutePolicy) -> Self {
        Self {
            bus,
            endpoints,
            policy,
            closing: Arc::new(watch::Sender::new(false)),
        }
    }

    /// End every open SSE response so its connection can close.
    pub fn close_streams(&self) {
        self.closing.send_replace(true);
    }

    /// Let new SSE responses run again after a restart.
    pub fn open_streams(&self) {
        self.closing.send_replace(false);
    }
}

/// Health route plus a fallback that runs every other request through the
/// pipeline.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(healthz))
        .fallback(handle)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "protocol": HTTP_PROTOCOL,
        "endpoints": state.endpoints.len(),
    }))
}

/// What the pipeline produced for one request.
enum Reply {
    Ready(Response),
    /// Subscription for a streaming route whose handler accepted the request.
    Stream(StreamSubscription),
}

/// Result of running one request through the pipeline.
struct Outcome {
    reply: Reply,
    endpoint: Option<Arc<Endpoint>>,
}

impl Outcome {
    fn unrouted(error: &RuntimeError) -> Self {
        Self::rejected(error, None)
    }

    fn rejected(error: &RuntimeError, endpoint: Option<Arc<Endpoint>>) -> Self {
        Self {
            reply: Reply::Ready(error_response(error)),
            endpoint,
        }
    }
}

/// Publishes `request.metrics` and `request.completed` for one call when
/// dropped.
///
/// Unary calls drop it as soon as the response is built; SSE responses carry
/// it in the body so the call is accounted when the stream ends.
struct Completion {
    state: HttpState,
    request_id: RequestId,
    endpoint: Option<Arc<Endpoint>>,
    method: Option<Method>,
    path: String,
    status_code: u16,
    started: Instant,
}

impl Drop for Completion {
    fn drop(&mut self) {
        record_call(
            &self.state.bus,
            &self.state.endpoints,
            &CallSummary {
                request_id: &self.request_id,
                endpoint: self.endpoint.as_deref(),
                status_code: self.status_code,
                elapsed: self.started.elapsed(),
                protocol: HTTP_PROTOCOL,
            },
        );
        if let Some(method) = self.method {
            publish_lifecycle(
                &self.state.bus,
                &self.request_id,
                LifecyclePhase::Completed,
                method,
                &self.path,
                self.endpoint.as_deref().map(Endpoint::route_key),
                Some(self.status_code),
            );
        }
    }
}

async fn handle(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let started = Instant::now();
    let hint = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);
    let claim = assign_request_id(&state.bus, hint.as_deref());
    let request_id = claim.id().clone();
    let method = request.method().as_str().parse::<Method>().ok();
    let path = request.uri().path().to_owned();
    let span = info_span!("http_request", request_id = %request_id, path = %path);

    async move {
        if let Some(method) = method {
            publish_lifecycle(&state.bus, &request_id, LifecyclePhase::Received, method, &path, None, None);
        }

        let outcome = match AssertUnwindSafe(run(&state, request, &claim))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("request pipeline panicked");
                Outcome::unrouted(&RuntimeError::Internal("request pipeline panicked".to_owned()))
            }
        };

        let mut completion = Completion {
            state: state.clone(),
            request_id: request_id.clone(),
            endpoint: outcome.endpoint,
            method,
            path,
            status_code: StatusCode::OK.as_u16(),
            started,
        };
        let mut response = match outcome.reply {
            Reply::Ready(response) => {
                completion.status_code = response.status().as_u16();
                drop(completion);
                response
            }
            Reply::Stream(subscription) => {
                sse_response(subscription, state.closing.subscribe(), completion)
            }
        };
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        response
    }
    .instrument(span)
    .await
}

async fn run(state: &HttpState, request: Request<Body>, claim: &RequestIdClaim) -> Outcome {
    let request_id = claim.id();
    let mut inbound = match inbound_from_http(request).await {
        Ok(inbound) => inbound,
        Err(error) => return Outcome::unrouted(&error),
    };
    inbound.request_id = Some(request_id.clone());

    let Some(route) = state.endpoints.match_endpoint(inbound.method, &inbound.path) else {
        debug!(method = %inbound.method, "no route");
        return Outcome::unrouted(&RuntimeError::RouteNotFound {
            method: inbound.method.to_string(),
            path: inbound.path,
        });
    };
    let endpoint = route.endpoint;

    if let Err(error) = state
        .policy
        .enforce(&endpoint, &mut inbound, &route.params, request_id)
        .await
    {
        debug!(route = %endpoint.route_key(), error = %error, "request rejected");
        return Outcome::rejected(&error, Some(endpoint));
    }

    let canonical = canonical(inbound, request_id, &endpoint, route.params);
    let reply = if endpoint.definition.streaming {
        match open_stream(&state.bus, &endpoint, canonical, claim.clone()) {
            Ok(subscription) => Reply::Stream(subscription),
            Err(error) => Reply::Ready(error_response(&error)),
        }
    } else {
        Reply::Ready(canonical_response(
            dispatch_unary(&state.bus, &endpoint, canonical).await,
        ))
    };
    Outcome {
        reply,
        endpoint: Some(endpoint),
    }
}

fn canonical(
    inbound: InboundRequest,
    request_id: &RequestId,
    endpoint: &Endpoint,
    params: BTreeMap<String, String>,
) -> CanonicalRequest {
    CanonicalRequest::from_inbound(
        inbound,
        request_id.clone(),
        endpoint.module_id.clone(),
        endpoint.handler(),
        params,
        HTTP_PROTOCOL,
    )
}

/// Attach to `stream.<id>` before publishing so no chunk is missed.
fn open_stream(
    bus: &EventBus,
    endpoint: &Endpoint,
    request: CanonicalRequest,
    claim: RequestIdClaim,
) -> Result<StreamSubscription, RuntimeError> {
    let subscription = bus.stream(&request.request_id).hold(claim);
    let reached = bus.emit(endpoint.handler(), EventPayload::Request(Box::new(request)));
    if reached == 0 {
        return Err(RuntimeError::HandlerNotFound(endpoint.handler().to_owned()));
    }
    Ok(subscription)
}

/// Forward chunks as SSE until `done`, the client leaves, or the server
/// closes streams.
fn sse_response(
    subscription: StreamSubscription,
    closing: watch::Receiver<bool>,
    completion: Completion,
) -> Response {
    let mut response = Sse::new(sse_events(subscription, closing, completion))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keep-alive"))
        .into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn sse_events(
    mut subscription: StreamSubscription,
    mut closing: watch::Receiver<bool>,
    completion: Completion,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    stream! {
        let _completion = completion;
        loop {
            let next = tokio::select! {
                chunk = subscription.next() => chunk,
                _ = closing.wait_for(|closed| *closed) => None,
            };
            let Some(chunk) = next else {
                debug!(channel = %subscription.channel(), "stream ended without done");
                break;
            };
            if chunk.done {
                yield Ok(Event::default().event("done").data("{}"));
                break;
            }
            yield Ok(Event::default().event("chunk").data(chunk.data.to_string()));
        }
    }
}

/// Render a handler reply. Redirects become `302` with `Location` and an
/// optional `session_id` cookie.
pub fn canonical_response(response: CanonicalResponse) -> Response {
    if let Some(redirect) = response.redirect() {
        let mut reply = StatusCode::FOUND.into_response();
        let headers = reply.headers_mut();
        match HeaderValue::from_str(&redirect.location) {
            Ok(location) => {
                headers.insert(LOCATION, location);
            }
            Err(_) => {
                warn!(location = %redirect.location, "redirect location is not a valid header");
                return error_response(&RuntimeError::Internal("invalid redirect location".to_owned()));
            }
        }
        if let Some(session_id) = redirect.session_id
            && let Ok(cookie) = HeaderValue::from_str(&format!(
                "session_id={session_id}; Path=/; HttpOnly; SameSite=Lax"
            ))
        {
            headers.insert(SET_COOKIE, cookie);
        }
        return reply;
    }
    let status =
        StatusCode::from_u16(response.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

pub fn error_response(error: &RuntimeError) -> Response {
    let mut response = canonical_response(CanonicalResponse::from_error(error));
    if let RuntimeError::RateLimited { retry_after_ms } = error {
        let seconds = retry_after_ms.div_ceil(1_000).max(1);
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

fn publish_lifecycle(
    bus: &EventBus,
    request_id: &RequestId,
    phase: LifecyclePhase,
    method: Method,
    path: &str,
    route: Option<String>,
    status_code: Option<u16>,
) {
    let name = match phase {
        LifecyclePhase::Received => names::REQUEST_RECEIVED,
        LifecyclePhase::Completed => names::REQUEST_COMPLETED,
    };
    bus.emit(
        name,
        EventPayload::RequestLifecycle(RequestLifecycle {
            request_id: request_id.clone(),
            phase,
            method,
            path: path.to_owned(),
            route,
            status_code,
            protocol: HTTP_PROTOCOL.to_owned(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use modos_policy::AuthTimeouts;
    use modos_protocol::{
        AuthRequirement, AuthValidation, EndpointDefinition, FieldSchema, FieldType, ModuleId,
        ObjectSchema, StreamChunk, ValidationSchema,
    };
    use parking_lot::Mutex;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn state(definitions: Vec<EndpointDefinition>) -> HttpState {
        let bus = EventBus::new();
        let endpoints = Arc::new(EndpointRegistry::new());
        endpoints
            .register_module_endpoints(&ModuleId::from("users"), definitions)
            .unwrap();
        HttpState::new(
            bus.clone(),
            endpoints,
            RoutePolicy::new(bus, AuthTimeouts::default()),
        )
    }

    fn reply_with(bus: &EventBus, handler: &str, data: Value) {
        bus.on(handler, move |event| {
            event.reply(EventPayload::Response(CanonicalResponse::ok(data.clone())));
            Ok(())
        });
    }

    async fn send(state: &HttpState, request: Request<Body>) -> anyhow::Result<(StatusCode, Response)> {
        let response = router(state.clone()).oneshot(request).await?;
        Ok((response.status(), response))
    }

    async fn json_body(response: Response) -> anyhow::Result<Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn get(uri: &str) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder().uri(uri).body(Body::empty())?)
    }

    #[tokio::test]
    async fn unary_route_round_trips_with_request_id() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/users/:id", "users.get")]);
        state.bus.on("users.get", |event| {
            let id = event
                .canonical_request()
                .and_then(|request| request.params.get("id").cloned());
            event.reply(EventPayload::Response(CanonicalResponse::ok(json!({ "id": id }))));
            Ok(())
        });
        let metrics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&metrics);
        state.bus.on(names::REQUEST_METRICS, move |event| {
            if let EventPayload::RequestMetrics(metric) = &event.payload {
                sink.lock().push(metric.clone());
            }
            Ok(())
        });

        let hint = "0b7e3a52-3c1f-4d8e-9a6b-2f4c5d6e7f80";
        let request = Request::builder()
            .uri("/users/42")
            .header(REQUEST_ID_HEADER, hint)
            .body(Body::empty())?;
        let (status, response) = send(&state, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some(hint)
        );
        assert_eq!(json_body(response).await?, json!({ "data": { "id": "42" } }));

        let metrics = metrics.lock();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].route.as_deref(), Some("GET /users/:id"));
        assert_eq!(metrics[0].status_code, 200);
        assert_eq!(metrics[0].protocol, "http");
        assert_eq!(state.endpoints.stats(Method::Get, "/users/:id").map(|s| s.call_count), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_route_is_404_and_still_accounted() -> anyhow::Result<()> {
        let state = state(vec![]);
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        state.bus.on("request.*", move |event| {
            sink.lock().push(event.name.clone());
            Ok(())
        });

        let (status, response) = send(&state, get("/missing")?).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await?["error"]["code"], "ROUTE_NOT_FOUND");
        assert_eq!(
            *completed.lock(),
            vec!["request.received", "request.metrics", "request.completed"]
        );
        assert_eq!(state.bus.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn protected_route_without_credentials_is_401() -> anyhow::Result<()> {
        let state = state(vec![
            EndpointDefinition::new(Method::Get, "/me", "users.me").with_auth(AuthRequirement::required()),
        ]);
        reply_with(&state.bus, "users.me", json!({}));
        let (status, _) = send(&state, get("/me")?).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn bearer_token_is_validated_over_the_bus() -> anyhow::Result<()> {
        let state = state(vec![
            EndpointDefinition::new(Method::Get, "/me", "users.me").with_auth(AuthRequirement::required()),
        ]);
        state.bus.on(names::AUTH_VALIDATE, |event| {
            let valid = matches!(&event.payload, EventPayload::ValidateCredential(query) if query.token == "good");
            event.reply(EventPayload::AuthValidation(AuthValidation {
                valid,
                user_id: valid.then(|| "u-1".to_owned()),
                ..AuthValidation::default()
            }));
            Ok(())
        });
        state.bus.on("users.me", |event| {
            let user = event
                .canonical_request()
                .and_then(|request| request.auth.as_ref())
                .and_then(|auth| auth.user_id.clone());
            event.reply(EventPayload::Response(CanonicalResponse::ok(json!({ "user": user }))));
            Ok(())
        });

        let request = Request::builder()
            .uri("/me")
            .header("authorization", "Bearer good")
            .body(Body::empty())?;
        let (status, response) = send(&state, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await?, json!({ "data": { "user": "u-1" } }));

        let request = Request::builder()
            .uri("/me")
            .header("authorization", "Bearer bad")
            .body(Body::empty())?;
        let (status, _) = send(&state, request).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_body_is_400() -> anyhow::Result<()> {
        let schema = ValidationSchema {
            body: Some(ObjectSchema::from([(
                "email".to_owned(),
                FieldSchema::typed(FieldType::String).required(),
            )])),
            ..ValidationSchema::default()
        };
        let state = state(vec![
            EndpointDefinition::new(Method::Post, "/users", "users.create").with_validation(schema),
        ]);
        reply_with(&state.bus, "users.create", json!({ "created": true }));

        let request = Request::builder()
            .method("POST")
            .uri("/users")
            .body(Body::from(r#"{"name":"ada"}"#))?;
        let (status, response) = send(&state, request).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await?["error"]["code"], "VALIDATION_ERROR");

        let request = Request::builder()
            .method("POST")
            .uri("/users")
            .body(Body::from(r#"{"email":"ada@example.com"}"#))?;
        let (status, _) = send(&state, request).await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_returns_429_with_retry_after() -> anyhow::Result<()> {
        let state = state(vec![
            EndpointDefinition::new(Method::Get, "/search", "users.search").with_rate_limit(60_000, 2),
        ]);
        reply_with(&state.bus, "users.search", json!([]));

        for _ in 0..2 {
            let (status, _) = send(&state, get("/search")?).await?;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, response) = send(&state, get("/search")?).await?;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(RETRY_AFTER));
        Ok(())
    }

    #[tokio::test]
    async fn silent_handler_is_504() -> anyhow::Result<()> {
        let state = state(vec![
            EndpointDefinition::new(Method::Get, "/slow", "users.slow").with_timeout_ms(30),
        ]);
        state.bus.on("users.slow", |_| Ok(()));
        let (status, response) = send(&state, get("/slow")?).await?;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json_body(response).await?["error"]["code"], "TIMEOUT");
        assert_eq!(state.bus.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn redirect_sets_location_and_session_cookie() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/login", "users.login")]);
        reply_with(
            &state.bus,
            "users.login",
            json!({ "redirect": "/dashboard", "sessionId": "sess-9" }),
        );
        let (status, response) = send(&state, get("/login")?).await?;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).and_then(|v| v.to_str().ok()),
            Some("/dashboard")
        );
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(cookie.starts_with("session_id=sess-9"));
        Ok(())
    }

    #[tokio::test]
    async fn streaming_route_forwards_chunks_and_detaches() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/feed", "users.feed").streaming()]);
        let channels = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&channels);
        let publisher = state.bus.clone();
        state.bus.on("users.feed", move |event| {
            let Some(request) = event.canonical_request() else {
                return Ok(());
            };
            let channel = names::stream_channel(&request.request_id);
            seen.lock().push(channel.clone());
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for n in 1..=2 {
                    publisher.emit(&channel, EventPayload::StreamChunk(StreamChunk::data(json!({ "n": n }))));
                }
                publisher.emit(&channel, EventPayload::StreamChunk(StreamChunk::done()));
            });
            Ok(())
        });

        let (status, response) = send(&state, get("/feed")?).await?;
        assert_eq!(status, StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let text = String::from_utf8(bytes.to_vec())?;
        assert!(text.contains("data: {\"n\":1}"));
        assert!(text.contains("data: {\"n\":2}"));
        assert!(text.contains("event: done"));

        let channel = channels.lock()[0].clone();
        assert!(!state.bus.has_listeners(&channel));
        Ok(())
    }

    fn ticker(state: &HttpState, channels: &Arc<Mutex<Vec<String>>>) {
        let seen = Arc::clone(channels);
        let publisher = state.bus.clone();
        state.bus.on("users.ticker", move |event| {
            let Some(request) = event.canonical_request() else {
                return Ok(());
            };
            let channel = names::stream_channel(&request.request_id);
            seen.lock().push(channel.clone());
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher.emit(&channel, EventPayload::StreamChunk(StreamChunk::data(json!({ "tick": 1 }))));
            });
            Ok(())
        });
    }

    #[tokio::test]
    async fn dropped_stream_response_detaches_listener() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/ticker", "users.ticker").streaming()]);
        let channels = Arc::new(Mutex::new(Vec::new()));
        ticker(&state, &channels);

        let (status, response) = send(&state, get("/ticker")?).await?;
        assert_eq!(status, StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.transpose()?.unwrap_or_default();
        assert!(String::from_utf8_lossy(&first).contains("data: {\"tick\":1}"));

        let channel = channels.lock()[0].clone();
        assert_eq!(state.bus.listener_count(&channel), 1);
        drop(body);
        assert_eq!(state.bus.listener_count(&channel), 0);
        let reached = state.bus.emit(
            &channel,
            EventPayload::StreamChunk(StreamChunk::data(json!({ "tick": 2 }))),
        );
        assert_eq!(reached, 0);
        Ok(())
    }

    #[tokio::test]
    async fn streaming_call_is_accounted_when_stream_ends() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/ticker", "users.ticker").streaming()]);
        let channels = Arc::new(Mutex::new(Vec::new()));
        ticker(&state, &channels);
        let metrics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&metrics);
        state.bus.on(names::REQUEST_METRICS, move |event| {
            if let EventPayload::RequestMetrics(metric) = &event.payload {
                sink.lock().push(metric.clone());
            }
            Ok(())
        });

        let (status, response) = send(&state, get("/ticker")?).await?;
        assert_eq!(status, StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        body.next().await.transpose()?;
        assert!(metrics.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let channel = channels.lock()[0].clone();
        state.bus.emit(&channel, EventPayload::StreamChunk(StreamChunk::done()));
        while body.next().await.transpose()?.is_some() {}

        let recorded = metrics.lock().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status_code, 200);
        assert!(recorded[0].duration_ms >= 30.0);
        assert_eq!(recorded[0].route.as_deref(), Some("GET /ticker"));
        Ok(())
    }

    #[tokio::test]
    async fn closing_streams_ends_open_responses() -> anyhow::Result<()> {
        let state = state(vec![EndpointDefinition::new(Method::Get, "/ticker", "users.ticker").streaming()]);
        let channels = Arc::new(Mutex::new(Vec::new()));
        ticker(&state, &channels);

        let (_, response) = send(&state, get("/ticker")?).await?;
        let mut body = response.into_body().into_data_stream();
        body.next().await.transpose()?;

        state.close_streams();
        let ended = tokio::time::timeout(Duration::from_millis(500), async {
            while body.next().await.transpose()?.is_some() {}
            anyhow::Ok(())
        })
        .await;
        assert!(matches!(ended, Ok(Ok(()))));
        let channel = channels.lock()[0].clone();
        assert_eq!(state.bus.listener_count(&channel), 0);
        Ok(())
    }

    #[tokio::test]
    async fn health_route_bypasses_pipeline() -> anyhow::Result<()> {
        let state = state(vec![]);
        let (status, response) = send(&state, get(HEALTH_PATH)?).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await?["status"], "ok");
        Ok(())
    }
}
