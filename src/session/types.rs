//! Common types for session management

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tower_lsp::lsp_types::{InitializeResult, ServerCapabilities, ServerInfo};

use crate::config::{
    DEFAULT_INITIALIZE_TIMEOUT_MS, DEFAULT_KILL_GRACE_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
use crate::process::{Endpoint, ProcessExit};
use crate::rpc::Notification;
use crate::session::error::SessionError;

/// Monotonic identifier of one server lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a session.
///
/// `Starting -> Initializing -> Running -> Stopping -> Stopped`; `Failed` is
/// only reachable before `Running`. Terminal states are never left.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Starting,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Failed(SessionError),
}

impl SessionState {
    /// Starting or Initializing
    pub fn is_starting(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Initializing)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

/// What a server advertised in its initialize result
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    server_info: Option<ServerInfo>,
    /// Names from `executeCommandProvider.commands`
    commands: BTreeSet<String>,
    /// Top-level capability keys the server filled in (e.g. `hoverProvider`)
    features: BTreeSet<String>,
    raw: ServerCapabilities,
}

impl Capabilities {
    pub fn from_initialize_result(result: InitializeResult) -> Self {
        let commands = result
            .capabilities
            .execute_command_provider
            .as_ref()
            .map(|provider| provider.commands.iter().cloned().collect())
            .unwrap_or_default();

        let features = match serde_json::to_value(&result.capabilities) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, _)| key)
                .collect(),
            _ => BTreeSet::new(),
        };

        Self {
            server_info: result.server_info,
            commands,
            features,
            raw: result.capabilities,
        }
    }

    pub fn commands(&self) -> &BTreeSet<String> {
        &self.commands
    }

    pub fn supports_command(&self, command: &str) -> bool {
        self.commands.contains(command)
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_info.as_ref().map(|info| info.name.as_str())
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_info
            .as_ref()
            .and_then(|info| info.version.as_deref())
    }

    /// `"<name> <version>"`, or `"Server"` when the server did not say
    pub fn server_label(&self) -> String {
        match (self.server_name(), self.server_version()) {
            (Some(name), Some(version)) => format!("{} {}", name, version),
            (Some(name), None) => name.to_string(),
            _ => "Server".to_string(),
        }
    }

    pub fn raw(&self) -> &ServerCapabilities {
        &self.raw
    }
}

/// Events published by the manager; the stream survives session churn
#[derive(Debug, Clone)]
pub enum ServerEvent {
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    Notification {
        session: SessionId,
        notification: Notification,
    },
    /// The server went away while Running. Nothing restarts it automatically.
    Crashed {
        session: SessionId,
        exit: Option<ProcessExit>,
    },
}

/// Snapshot of the session currently held by the manager
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

/// Everything one session needs to come up and go down
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub endpoint: Endpoint,
    /// Workspace root advertised in initialize
    pub root: Option<PathBuf>,
    pub initialization_options: Option<Value>,
    pub initialize_timeout: Duration,
    pub request_timeout: Duration,
    /// Bound on the shutdown request round-trip
    pub shutdown_timeout: Duration,
    /// Time a server gets to exit before it is killed
    pub kill_grace: Duration,
}

impl SessionSettings {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            root: None,
            initialization_options: None,
            initialize_timeout: Duration::from_millis(DEFAULT_INITIALIZE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        }
    }
}
