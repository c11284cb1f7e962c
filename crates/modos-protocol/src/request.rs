//! Canonical request/response shapes exchanged over the bus.
//!
//! Protocol handlers translate their transport-native requests into an
//! [`InboundRequest`], resolve it against the endpoint table, and publish the
//! resulting [`CanonicalRequest`] to the module-owned handler event.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorBody, RuntimeError};
use crate::ids::{ModuleId, RequestId};

/// Request method. Mirrors the HTTP verbs; non-HTTP protocols map onto them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RuntimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(RuntimeError::Validation(format!(
                "unsupported method: {other}"
            ))),
        }
    }
}

/// Established identity attached to a request once authentication passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// Protocol-neutral request before route resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Header names are stored lower-cased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub is_proxied: bool,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: None,
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            auth: None,
            client_ip: None,
            is_proxied: false,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Identity used for rate limiting: user when known, else client address.
    pub fn client_identity(&self) -> String {
        if let Some(user) = self.auth.as_ref().and_then(|auth| auth.user_id.as_ref()) {
            return format!("user:{user}");
        }
        self.client_ip
            .clone()
            .map(|ip| format!("ip:{ip}"))
            .unwrap_or_else(|| "anonymous".to_owned())
    }
}

/// Request event published to a module-owned handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRequest {
    pub request_id: RequestId,
    pub method: Method,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthContext>,
    pub module_id: ModuleId,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub is_proxied: bool,
    pub protocol: String,
}

impl CanonicalRequest {
    pub fn from_inbound(
        inbound: InboundRequest,
        request_id: RequestId,
        module_id: ModuleId,
        handler: impl Into<String>,
        params: BTreeMap<String, String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            method: inbound.method,
            path: inbound.path,
            params,
            query: inbound.query,
            headers: inbound.headers,
            body: inbound.body,
            auth: inbound.auth,
            module_id,
            handler: handler.into(),
            client_ip: inbound.client_ip,
            is_proxied: inbound.is_proxied,
            protocol: protocol.into(),
        }
    }
}

/// A redirect carried in a success payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
    pub session_id: Option<String>,
}

/// Reply to a canonical request: `{data}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalResponse {
    Error { error: ErrorBody },
    Data { data: Value },
}

impl CanonicalResponse {
    pub fn ok(data: Value) -> Self {
        Self::Data { data }
    }

    pub fn from_error(error: &RuntimeError) -> Self {
        Self::Error {
            error: error.to_body(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Data { .. } => {
                if self.redirect().is_some() {
                    302
                } else {
                    200
                }
            }
            Self::Error { error } => error.status_code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    /// `data.redirect` (and optional `data.sessionId`) issue a redirect.
    pub fn redirect(&self) -> Option<Redirect> {
        let Self::Data { data } = self else {
            return None;
        };
        let location = data.get("redirect").and_then(Value::as_str)?;
        Some(Redirect {
            location: location.to_owned(),
            session_id: data
                .get("sessionId")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        })
    }
}

impl From<RuntimeError> for CanonicalResponse {
    fn from(error: RuntimeError) -> Self {
        Self::from_error(&error)
    }
}
