use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::process::{Endpoint, SpawnSpec};
use crate::session::SessionSettings;
use crate::trigger::{DocumentFilter, DocumentSelector, RouterSettings};

const APP_DIR: &str = "easyergo-client";

pub const DEFAULT_COMMAND: &str = "python";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_KILL_GRACE_MS: u64 = 3_000;

/// Window in which restart-worthy triggers collapse into one restart
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown setting '{0}'")]
    UnknownKey(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid document selector pattern: {0}")]
    Selector(#[from] regex::Error),
}

/// How the server is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Stdio,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub mode: ServerMode,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: vec!["-m".to_string(), "easyergo.cli".to_string()],
            cwd: None,
            env: HashMap::new(),
            mode: ServerMode::Stdio,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub document_selector: Vec<DocumentFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    pub initialize_ms: u64,
    pub request_ms: u64,
    pub shutdown_ms: u64,
    pub kill_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            initialize_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            request_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

/// Client settings as stored in `settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub timeouts: TimeoutSettings,
    /// Settings keys whose change restarts the server
    pub restart_on: Vec<String>,
    pub debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            timeouts: TimeoutSettings::default(),
            restart_on: vec!["server".to_string(), "client".to_string()],
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from the default location.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (settings_path(), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_json(&content).map_err(|source| ConfigError::Parse { path, source }),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Replaces the value at a dotted key such as `server.args`.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.to_string(),
            reason,
        };

        let (parent, field): (String, &str) = match key.rsplit_once('.') {
            Some((parent, field)) => (parent.split('.').map(|part| format!("/{}", part)).collect(), field),
            None => (String::new(), key),
        };

        let mut tree = serde_json::to_value(&*self).map_err(|e| invalid(e.to_string()))?;
        let Some(Value::Object(map)) = tree.pointer_mut(&parent) else {
            return Err(ConfigError::UnknownKey(key.to_string()));
        };
        // Optional fields are skipped when unset but are still valid keys
        if !map.contains_key(field) && !is_optional_key(field) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        map.insert(field.to_string(), value);

        let updated: Settings = serde_json::from_value(tree).map_err(|e| invalid(e.to_string()))?;
        // Validate before committing
        DocumentSelector::compile(&updated.client.document_selector)?;
        *self = updated;
        Ok(())
    }

    /// Settings for the next session, as the manager consumes them
    pub fn session_settings(&self) -> SessionSettings {
        let endpoint = match self.server.mode {
            ServerMode::Stdio => Endpoint::Spawn(SpawnSpec {
                command: self.server.command.clone(),
                args: self.server.args.clone(),
                cwd: self.server.cwd.clone(),
                env: self.server.env.clone(),
            }),
            ServerMode::Tcp => Endpoint::Tcp {
                host: self.server.host.clone(),
                port: self.server.port,
            },
        };

        SessionSettings {
            endpoint,
            root: self
                .server
                .cwd
                .clone()
                .or_else(|| std::env::current_dir().ok()),
            initialization_options: self.client.initialization_options.clone(),
            initialize_timeout: Duration::from_millis(self.timeouts.initialize_ms),
            request_timeout: Duration::from_millis(self.timeouts.request_ms),
            shutdown_timeout: Duration::from_millis(self.timeouts.shutdown_ms),
            kill_grace: Duration::from_millis(self.timeouts.kill_grace_ms),
        }
    }

    pub fn document_selector(&self) -> Result<DocumentSelector, ConfigError> {
        Ok(DocumentSelector::compile(&self.client.document_selector)?)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// What the trigger router needs: selector, restart keys and debounce window
    pub fn router_settings(&self) -> Result<RouterSettings, ConfigError> {
        Ok(RouterSettings {
            selector: self.document_selector()?,
            restart_keys: self.restart_on.clone(),
            debounce: self.debounce(),
        })
    }
}

fn is_optional_key(part: &str) -> bool {
    matches!(part, "cwd" | "initializationOptions")
}

/// Returns the path to the data directory for easyergo-client.
/// Uses $XDG_DATA_HOME/easyergo-client if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/easyergo-client,
/// or ./easyergo-client if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the config directory for easyergo-client.
/// Same fallbacks as [`data_dir`], with $XDG_CONFIG_HOME and ~/.config.
pub fn config_dir() -> PathBuf {
    config_dir_with_env(std::env::var("XDG_CONFIG_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the default settings file.
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("easyergo-client.log")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    app_dir(xdg_data_home, home_dir, ".local/share")
}

fn config_dir_with_env(xdg_config_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    app_dir(xdg_config_home, home_dir, ".config")
}

fn app_dir(xdg_home: Option<String>, home_dir: Option<PathBuf>, home_relative: &str) -> PathBuf {
    let base = xdg_home
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(home_relative)))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}
