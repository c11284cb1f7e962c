//! Module records, manifests, lifecycle states, and audit events.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::ModuleId;

/// Classification of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Core,
    Service,
    Daemon,
    Plugin,
    Extension,
}

impl ModuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Service => "service",
            Self::Daemon => "daemon",
            Self::Plugin => "plugin",
            Self::Extension => "extension",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = RuntimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "core" => Ok(Self::Core),
            "service" => Ok(Self::Service),
            "daemon" => Ok(Self::Daemon),
            "plugin" => Ok(Self::Plugin),
            "extension" => Ok(Self::Extension),
            other => Err(RuntimeError::Manifest(format!("unknown module type: {other}"))),
        }
    }
}

/// Per-module lifecycle state.
///
/// `discovered → installed → loading → running → stopping → stopped`, with
/// `error` reachable from `loading`, `running`, and `stopping`. A stopped or
/// errored module may be loaded again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    #[default]
    Discovered,
    Installed,
    Loading,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Installed => "installed",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: ModuleStatus) -> bool {
        use ModuleStatus::*;
        matches!(
            (*self, next),
            (Discovered, Installed)
                | (Installed, Loading)
                | (Loading, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Loading)
                | (Loading | Running | Stopping, Error)
                | (Error, Loading)
                | (Error, Stopped)
                | (Stopped | Error, Installed)
        )
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub healthy: bool,
    pub message: String,
}

impl ModuleHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCliCommand {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Optional `cli` block of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCli {
    #[serde(default)]
    pub commands: Vec<ModuleCliCommand>,
}

/// On-disk manifest (`module.yaml`). Identity fields are optional here so a
/// malformed manifest can be reported instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "type")]
    pub module_type: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub cli: Option<ModuleCli>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_start: Option<bool>,
    #[serde(default)]
    pub entry: Option<String>,
}

impl ModuleManifest {
    /// Name and version, both required and non-empty; version must look like semver.
    pub fn identity(&self) -> RuntimeResult<(String, String)> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RuntimeError::Manifest("missing name".to_owned()))?;
        let version = self
            .version
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| RuntimeError::Manifest(format!("module {name}: missing version")))?;
        if !is_semver(version) {
            return Err(RuntimeError::Manifest(format!(
                "module {name}: version {version} is not semver"
            )));
        }
        Ok((name.to_owned(), version.to_owned()))
    }
}

/// `major.minor.patch` with optional `-pre` and `+build` suffixes.
pub fn is_semver(raw: &str) -> bool {
    let core = raw.split('+').next().unwrap_or_default();
    let core = core.split('-').next().unwrap_or_default();
    let parts: Vec<_> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// A discovered module as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: ModuleId,
    pub version: String,
    pub module_type: ModuleType,
    pub path: PathBuf,
    pub dependencies: Vec<ModuleId>,
    pub enabled: bool,
    pub auto_start: bool,
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<ModuleCli>,
    pub status: ModuleStatus,
    pub health: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Module {
    pub fn new(
        name: impl Into<ModuleId>,
        version: impl Into<String>,
        module_type: ModuleType,
        path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            version: version.into(),
            module_type,
            path: path.into(),
            dependencies: Vec::new(),
            enabled: true,
            auto_start: true,
            config: Map::new(),
            description: None,
            author: None,
            cli: None,
            status: ModuleStatus::Discovered,
            health: HealthStatus::Unknown,
            health_message: None,
            last_error: None,
            discovered_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = impl Into<ModuleId>>,
    ) -> Self {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ModuleStatus::Running
    }
}

/// Audit record of something that happened to a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleEventKind {
    Discovered {
        version: String,
        path: PathBuf,
    },
    StatusChanged {
        from: ModuleStatus,
        to: ModuleStatus,
    },
    HealthChecked {
        healthy: bool,
        message: String,
    },
    ConfigChanged {
        key: String,
    },
}

impl ModuleEventKind {
    /// Bus event name suffix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "discovered",
            Self::StatusChanged { .. } => "status_changed",
            Self::HealthChecked { .. } => "health_checked",
            Self::ConfigChanged { .. } => "config_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleEvent {
    pub module_id: ModuleId,
    pub at: DateTime<Utc>,
    pub kind: ModuleEventKind,
}

impl ModuleEvent {
    pub fn new(module_id: ModuleId, kind: ModuleEventKind) -> Self {
        Self {
            module_id,
            at: Utc::now(),
            kind,
        }
    }
}
