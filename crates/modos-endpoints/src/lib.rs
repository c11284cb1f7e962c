//! # modos-endpoints — route table for the server core
//!
//! Maps `METHOD /pattern` to the module handler that serves it, matches
//! concrete paths to the most specific route, and keeps per-route call stats.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use modos_protocol::{
    Endpoint, EndpointDefinition, EndpointStats, Method, ModuleId, RuntimeError, RuntimeResult,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

/// Leading slash, no trailing slash, no empty segments.
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<_> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

impl Segment {
    fn parse(raw: &str) -> RuntimeResult<Self> {
        if raw == "*" {
            return Ok(Self::Wildcard);
        }
        if let Some(name) = raw.strip_prefix(':') {
            if name.is_empty() {
                return Err(RuntimeError::Validation(
                    "path parameter without a name".to_owned(),
                ));
            }
            return Ok(Self::Param(name.to_owned()));
        }
        Ok(Self::Literal(raw.to_owned()))
    }

    fn accepts(&self, actual: &str) -> bool {
        match self {
            Self::Literal(expected) => expected == actual,
            Self::Param(_) | Self::Wildcard => true,
        }
    }

    /// Shape used for collision checks: parameter names do not matter.
    fn shape(&self) -> &str {
        match self {
            Self::Literal(literal) => literal,
            Self::Param(_) => ":",
            Self::Wildcard => "*",
        }
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn parse_pattern(pattern: &str) -> RuntimeResult<Vec<Segment>> {
    path_segments(pattern).map(Segment::parse).collect()
}

/// Positional extraction of `:named` segments.
pub fn extract_params(path: &str, pattern: &str) -> BTreeMap<String, String> {
    path_segments(pattern)
        .zip(path_segments(path))
        .filter_map(|(expected, actual)| {
            let name = expected.strip_prefix(':')?;
            (!name.is_empty()).then(|| (name.to_owned(), actual.to_owned()))
        })
        .collect()
}

/// Ranking of a matched route: literal prefix, literal count, earlier registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    literal_prefix: usize,
    literals: usize,
    earlier: std::cmp::Reverse<u64>,
}

struct RouteEntry {
    endpoint: Arc<Endpoint>,
    segments: Vec<Segment>,
    order: u64,
}

impl RouteEntry {
    fn shape_key(method: Method, segments: &[Segment]) -> String {
        let shape: Vec<_> = segments.iter().map(Segment::shape).collect();
        format!("{method} /{}", shape.join("/"))
    }

    fn specificity(&self, path: &[&str]) -> Option<Specificity> {
        if self.segments.len() != path.len() {
            return None;
        }
        if !self
            .segments
            .iter()
            .zip(path)
            .all(|(segment, actual)| segment.accepts(actual))
        {
            return None;
        }
        let is_literal = |segment: &&Segment| matches!(segment, Segment::Literal(_));
        Some(Specificity {
            literal_prefix: self.segments.iter().take_while(is_literal).count(),
            literals: self.segments.iter().filter(is_literal).count(),
            earlier: std::cmp::Reverse(self.order),
        })
    }
}

#[derive(Default)]
struct RouteTable {
    routes: Vec<RouteEntry>,
    next_order: u64,
}

impl RouteTable {
    fn find_shape(&self, key: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|route| {
            RouteEntry::shape_key(route.endpoint.method(), &route.segments) == key
        })
    }
}

/// A resolved route and the parameters bound from the concrete path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub endpoint: Arc<Endpoint>,
    pub params: BTreeMap<String, String>,
}

/// Route table shared by every protocol handler.
///
/// Matching takes the read lock; registration and bulk removal take the write
/// lock, so a concurrent match sees a module's routes either all present or
/// all gone. Call stats live in a separate map and never contend with routing.
#[derive(Default)]
pub struct EndpointRegistry {
    table: RwLock<RouteTable>,
    stats: Mutex<HashMap<String, EndpointStats>>,
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("routes", &self.len())
            .finish()
    }
}

struct Prepared {
    endpoint: Endpoint,
    segments: Vec<Segment>,
    shape: String,
}

fn prepare(module_id: &ModuleId, definition: EndpointDefinition) -> RuntimeResult<Prepared> {
    if definition.handler.trim().is_empty() {
        return Err(RuntimeError::Validation(format!(
            "endpoint {} {} has no handler",
            definition.method, definition.path
        )));
    }
    let pattern = normalize_path(&definition.path);
    let segments = parse_pattern(&pattern)?;
    let shape = RouteEntry::shape_key(definition.method, &segments);
    Ok(Prepared {
        endpoint: Endpoint {
            module_id: module_id.clone(),
            pattern,
            definition,
            registered_at: Utc::now(),
        },
        segments,
        shape,
    })
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_endpoint(
        &self,
        module_id: &ModuleId,
        definition: EndpointDefinition,
    ) -> RuntimeResult<Arc<Endpoint>> {
        let mut registered = self.register_module_endpoints(module_id, vec![definition])?;
        registered
            .pop()
            .ok_or_else(|| RuntimeError::internal("registration produced no endpoint"))
    }

    /// Register a batch for one module. Nothing is registered if any route
    /// collides, with the table or within the batch.
    pub fn register_module_endpoints(
        &self,
        module_id: &ModuleId,
        definitions: Vec<EndpointDefinition>,
    ) -> RuntimeResult<Vec<Arc<Endpoint>>> {
        let prepared = definitions
            .into_iter()
            .map(|definition| prepare(module_id, definition))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let mut table = self.table.write();
        for (index, candidate) in prepared.iter().enumerate() {
            let existing_module = table
                .find_shape(&candidate.shape)
                .map(|route| route.endpoint.module_id.to_string())
                .or_else(|| {
                    prepared[..index]
                        .iter()
                        .any(|earlier| earlier.shape == candidate.shape)
                        .then(|| module_id.to_string())
                });
            if let Some(existing_module) = existing_module {
                return Err(RuntimeError::DuplicateRoute {
                    method: candidate.endpoint.method().to_string(),
                    path: candidate.endpoint.pattern.clone(),
                    existing_module,
                });
            }
        }

        let mut registered = Vec::with_capacity(prepared.len());
        for Prepared {
            endpoint, segments, ..
        } in prepared
        {
            let endpoint = Arc::new(endpoint);
            let order = table.next_order;
            table.next_order += 1;
            debug!(
                module = %module_id,
                route = %endpoint.route_key(),
                handler = %endpoint.handler(),
                "endpoint registered"
            );
            table.routes.push(RouteEntry {
                endpoint: Arc::clone(&endpoint),
                segments,
                order,
            });
            registered.push(endpoint);
        }
        info!(module = %module_id, count = registered.len(), "module endpoints registered");
        Ok(registered)
    }

    /// Best route for a concrete request path, if any.
    pub fn match_endpoint(&self, method: Method, path: &str) -> Option<RouteMatch> {
        let path = normalize_path(path);
        let actual: Vec<_> = path_segments(&path).collect();
        let table = self.table.read();
        let best = table
            .routes
            .iter()
            .filter(|route| route.endpoint.method() == method)
            .filter_map(|route| route.specificity(&actual).map(|rank| (rank, route)))
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, route)| Arc::clone(&route.endpoint))?;
        let params = extract_params(&path, &best.pattern);
        Some(RouteMatch {
            endpoint: best,
            params,
        })
    }

    /// Remove every route owned by `module_id` in one critical section.
    pub fn unregister_module_endpoints(&self, module_id: &ModuleId) -> usize {
        let removed: Vec<String> = {
            let mut table = self.table.write();
            let mut removed = Vec::new();
            table.routes.retain(|route| {
                let owned = route.endpoint.module_id == *module_id;
                if owned {
                    removed.push(route.endpoint.route_key());
                }
                !owned
            });
            removed
        };
        if !removed.is_empty() {
            let mut stats = self.stats.lock();
            for key in &removed {
                stats.remove(key);
            }
            info!(module = %module_id, count = removed.len(), "module endpoints removed");
        }
        removed.len()
    }

    /// Fold one call outcome into the route's in-memory counters.
    pub fn update_stats(&self, method: Method, pattern: &str, success: bool, duration_ms: f64) {
        let key = format!("{method} {}", normalize_path(pattern));
        self.stats
            .lock()
            .entry(key)
            .or_default()
            .record(success, duration_ms);
    }

    pub fn stats(&self, method: Method, pattern: &str) -> Option<EndpointStats> {
        let key = format!("{method} {}", normalize_path(pattern));
        self.stats.lock().get(&key).cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<String, EndpointStats> {
        self.stats
            .lock()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.clone()))
            .collect()
    }

    /// Registered routes in registration order.
    pub fn list_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.table
            .read()
            .routes
            .iter()
            .map(|route| Arc::clone(&route.endpoint))
            .collect()
    }

    pub fn endpoints_for_module(&self, module_id: &ModuleId) -> Vec<Arc<Endpoint>> {
        self.table
            .read()
            .routes
            .iter()
            .filter(|route| route.endpoint.module_id == *module_id)
            .map(|route| Arc::clone(&route.endpoint))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
