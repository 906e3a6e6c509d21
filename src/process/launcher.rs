//! Launcher trait for bringing up a server behind a [`ProcessHandle`]

use std::fmt;

use async_trait::async_trait;

use crate::process::error::SpawnError;
use crate::process::handle::{ProcessHandle, SpawnSpec};

/// Where the language server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Spawn a child process and talk over its stdio
    Spawn(SpawnSpec),
    /// Connect to an already running server
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Spawn(spec) if spec.args.is_empty() => write!(f, "{}", spec.command),
            Endpoint::Spawn(spec) => write!(f, "{} {}", spec.command, spec.args.join(" ")),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Brings up one server lifetime for an endpoint
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, endpoint: &Endpoint) -> Result<ProcessHandle, SpawnError>;
}

/// Launcher backed by real OS processes and sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(&self, endpoint: &Endpoint) -> Result<ProcessHandle, SpawnError> {
        match endpoint {
            Endpoint::Spawn(spec) => ProcessHandle::spawn(spec),
            Endpoint::Tcp { host, port } => ProcessHandle::connect(host, *port).await,
        }
    }
}
