use std::time::Duration;

use thiserror::Error;

use crate::process::{ProcessExit, SpawnError};
use crate::rpc::ResponseError;

/// Failure of a single protocol call. Never fatal to the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Language server session closed")]
    SessionClosed,

    #[error("Language server returned error {}: {}", .0.code, .0.message)]
    Server(ResponseError),
}

/// Outcome of a start, restart or abort of one session.
///
/// `Clone` so that one outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Language server did not answer initialize within {0:?}")]
    InitializeTimeout(Duration),

    #[error("Language server failed to initialize: {0}")]
    Initialize(String),

    #[error("Language server exited during startup ({})", describe_exit(.0))]
    ExitedDuringStartup(Option<ProcessExit>),

    #[error("Start was superseded by a newer restart")]
    Superseded,

    #[error("Language server session was stopped")]
    Stopped,
}

fn describe_exit(exit: &Option<ProcessExit>) -> String {
    match exit {
        Some(exit) => exit.to_string(),
        None => "exit status unknown".to_string(),
    }
}

/// Failure of a caller-facing call routed through the manager
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("There is no language server running.")]
    NoActiveSession,

    #[error("{server} does not implement any commands.")]
    NoCommands { server: String },

    #[error("Command '{command}' is not provided by the language server")]
    UnknownCommand { command: String },

    #[error("Failed to encode request parameters: {0}")]
    Encode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
