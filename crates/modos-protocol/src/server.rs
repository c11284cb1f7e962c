//! Server and protocol lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server core state.
///
/// `initialized → starting → running → stopping → stopped`; `error` is
/// reachable from anywhere. `stopped → starting` (restart) and
/// `error → starting` are the only backward moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (*self, next),
            (_, Error)
                | (Initialized | Stopped | Error, Starting)
                | (Starting, Running)
                | (Starting | Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol handler state: `initialized → running → stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    #[default]
    Initialized,
    Running,
    Stopped,
}

impl ProtocolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
