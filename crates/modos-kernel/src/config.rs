use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use modos_policy::AuthTimeouts;
use serde::{Deserialize, Serialize};

/// Listener settings for the HTTP protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpSettings {
    pub host: String,
    /// `0` asks the OS for a free port.
    pub port: u16,
    pub drain_timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8787,
            drain_timeout_ms: 2_000,
        }
    }
}

/// Server configuration, loaded from YAML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub http: HttpSettings,
    pub graceful_timeout_ms: u64,
    /// Applied to registered routes that declare a zero timeout.
    pub default_route_timeout_ms: u64,
    pub auth: AuthTimeouts,
    pub module_dirs: Vec<PathBuf>,
    pub sweep_interval_ms: u64,
    pub middleware_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            graceful_timeout_ms: 10_000,
            default_route_timeout_ms: modos_protocol::DEFAULT_ENDPOINT_TIMEOUT_MS,
            auth: AuthTimeouts::default(),
            module_dirs: vec![PathBuf::from("modules")],
            sweep_interval_ms: 30_000,
            middleware_grace_ms: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("failed to parse server config")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn middleware_grace(&self) -> Duration {
        Duration::from_millis(self.middleware_grace_ms)
    }
}
