//! axum request → [`InboundRequest`].

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::{self, Body};
use axum::extract::{ConnectInfo, Query};
use axum::http::Request;
use modos_protocol::{InboundRequest, Method, RuntimeError, RuntimeResult};
use serde_json::Value;

/// Upper bound on a buffered JSON body.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Buffer and decode one HTTP request. An empty body is `None`; anything
/// else must be JSON.
pub async fn inbound_from_http(request: Request<Body>) -> RuntimeResult<InboundRequest> {
    let (parts, body) = request.into_parts();
    let method: Method = parts.method.as_str().parse()?;

    let Query(query) = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
        .map_err(|rejection| RuntimeError::Validation(format!("invalid query string: {rejection}")))?;

    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_owned());
        }
    }

    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(ToOwned::to_owned);
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let bytes = body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|error| RuntimeError::Validation(format!("unreadable body: {error}")))?;
    let body = if bytes.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice::<Value>(&bytes)
                .map_err(|error| RuntimeError::Validation(format!("body is not valid JSON: {error}")))?,
        )
    };

    Ok(InboundRequest {
        request_id: None,
        method,
        path: parts.uri.path().to_owned(),
        query,
        headers,
        body,
        auth: None,
        is_proxied: forwarded.is_some(),
        client_ip: forwarded.or(peer),
    })
}
