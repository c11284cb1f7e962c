//! Endpoint definitions and their attached policy.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::ModuleId;
use crate::request::Method;

/// Default correlated-call timeout for a route.
pub const DEFAULT_ENDPOINT_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_ENDPOINT_TIMEOUT_MS
}

/// Authentication requirement of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequirement {
    #[serde(default)]
    pub required: bool,
    /// Named strategies allowed to establish identity when no bearer is present.
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub session_based: bool,
}

impl AuthRequirement {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategies(
        mut self,
        strategies: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.strategies = strategies.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_based(mut self) -> Self {
        self.session_based = true;
        self
    }
}

/// Primitive type check for a validated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Structural constraints on a single field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
}

impl FieldSchema {
    pub fn typed(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min_length(mut self, min_length: usize) -> Self {
        self.min_length = Some(min_length);
        self
    }

    pub fn minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }
}

/// Field name → constraints, checked in declaration order.
pub type ObjectSchema = IndexMap<String, FieldSchema>;

/// Validation schema for the three request inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ObjectSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ObjectSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ObjectSchema>,
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub window_ms: u64,
    pub max: u32,
}

/// What a module declares when registering a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDefinition {
    pub method: Method,
    pub path: String,
    /// Bus event invoked to serve this route.
    pub handler: String,
    #[serde(default)]
    pub auth: AuthRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EndpointDefinition {
    pub fn new(method: Method, path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            handler: handler.into(),
            auth: AuthRequirement::default(),
            validation: None,
            rate_limit: None,
            streaming: false,
            timeout_ms: DEFAULT_ENDPOINT_TIMEOUT_MS,
            description: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_validation(mut self, validation: ValidationSchema) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_rate_limit(mut self, window_ms: u64, max: u32) -> Self {
        self.rate_limit = Some(RateLimitSpec { window_ms, max });
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A route as stored in the endpoint registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub module_id: ModuleId,
    /// Normalized path pattern (leading slash, no trailing slash).
    pub pattern: String,
    #[serde(flatten)]
    pub definition: EndpointDefinition,
    pub registered_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn method(&self) -> Method {
        self.definition.method
    }

    pub fn handler(&self) -> &str {
        &self.definition.handler
    }

    /// `METHOD /pattern`, used as the route label in metrics and stats.
    pub fn route_key(&self) -> String {
        format!("{} {}", self.definition.method, self.pattern)
    }
}

/// Per-route call statistics, in memory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub call_count: u64,
    pub success_count: u64,
    pub average_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_called_at: Option<DateTime<Utc>>,
}

impl EndpointStats {
    /// Fold one call into the counters and the rolling average.
    pub fn record(&mut self, success: bool, duration_ms: f64) {
        self.call_count = self.call_count.saturating_add(1);
        if success {
            self.success_count = self.success_count.saturating_add(1);
        }
        let count = self.call_count as f64;
        self.average_latency_ms += (duration_ms - self.average_latency_ms) / count;
        self.last_called_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_defaults_from_wire() {
        let definition: EndpointDefinition = serde_json::from_value(json!({
            "method": "GET",
            "path": "/users/:id",
            "handler": "users.get"
        }))
        .unwrap();
        assert_eq!(definition.timeout_ms, DEFAULT_ENDPOINT_TIMEOUT_MS);
        assert!(!definition.auth.required);
        assert!(!definition.streaming);
    }

    #[test]
    fn validation_schema_parses_type_keyword() {
        let schema: ValidationSchema = serde_json::from_value(json!({
            "body": {
                "name": { "type": "string", "required": true, "minLength": 3 },
                "age": { "type": "integer", "minimum": 0 }
            }
        }))
        .unwrap();
        let body = schema.body.unwrap();
        let keys: Vec<_> = body.keys().cloned().collect();
        assert_eq!(keys, vec!["name", "age"]);
        assert_eq!(body["name"].field_type, Some(FieldType::String));
        assert_eq!(body["name"].min_length, Some(3));
    }

    #[test]
    fn stats_keep_rolling_average() {
        let mut stats = EndpointStats::default();
        stats.record(true, 10.0);
        stats.record(false, 30.0);
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.success_count, 1);
        assert!((stats.average_latency_ms - 20.0).abs() < f64::EPSILON);
    }
}
