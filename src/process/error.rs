use std::path::PathBuf;

use thiserror::Error;

/// Why a server process (or socket connection) could not be brought up.
///
/// Carries strings instead of `io::Error` so that a single failure can be
/// reported to every caller waiting on the same start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("Language server executable not found: {command}")]
    NotFound { command: String },

    #[error("Permission denied while launching {command}")]
    PermissionDenied { command: String },

    #[error("Working directory {path:?} is not usable: {reason}")]
    WorkingDirectory { path: PathBuf, reason: String },

    #[error("Failed to connect to language server at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Failed to launch {command}: {reason}")]
    Io { command: String, reason: String },
}

impl SpawnError {
    pub(crate) fn from_io(command: &str, error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => SpawnError::NotFound {
                command: command.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                command: command.to_string(),
            },
            _ => SpawnError::Io {
                command: command.to_string(),
                reason: error.to_string(),
            },
        }
    }
}
