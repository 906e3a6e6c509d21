//! Shared fixtures for integration tests: an in-process language server
//! built on tower-lsp and a launcher that hands it out.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use easyergo_client::process::{Endpoint, Launcher, ProcessHandle, SpawnError, SpawnSpec};
use easyergo_client::session::{ServerEvent, SessionId, SessionSettings, SessionState};

pub const FAKE_SERVER_NAME: &str = "fake-server";

/// Command the fake launcher refuses, like a bad executable path
pub const MISSING_COMMAND: &str = "missing";

/// How one fake server instance behaves
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub commands: Vec<String>,
    pub hang_initialize: bool,
    pub reject_initialize: bool,
    pub command_delay: Option<Duration>,
}

impl FakeScript {
    pub fn with_commands(commands: &[&str]) -> Self {
        Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang_initialize: true,
            ..Default::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_initialize: true,
            ..Default::default()
        }
    }

    pub fn slow(commands: &[&str], delay: Duration) -> Self {
        Self {
            command_delay: Some(delay),
            ..Self::with_commands(commands)
        }
    }
}

struct FakeServer {
    client: Client,
    instance: usize,
    script: FakeScript,
}

#[tower_lsp::async_trait]
impl LanguageServer for FakeServer {
    async fn initialize(&self, _params: InitializeParams) -> Result<InitializeResult> {
        if self.script.hang_initialize {
            std::future::pending::<()>().await;
        }
        if self.script.reject_initialize {
            return Err(Error::invalid_params("unsupported client"));
        }

        let execute_command_provider = (!self.script.commands.is_empty()).then(|| ExecuteCommandOptions {
            commands: self.script.commands.clone(),
            ..Default::default()
        });

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                execute_command_provider,
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: FAKE_SERVER_NAME.to_string(),
                version: Some(self.instance.to_string()),
            }),
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        let configuration = self
            .client
            .configuration(vec![ConfigurationItem {
                scope_uri: None,
                section: Some("easyergo".to_string()),
            }])
            .await;
        let message = match configuration {
            Ok(values) => format!("configuration: {}", Value::Array(values)),
            Err(e) => format!("configuration failed: {}", e),
        };
        self.client.log_message(MessageType::INFO, message).await;
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        if let Some(delay) = self.script.command_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Some(json!({
            "instance": self.instance,
            "command": params.command,
            "arguments": params.arguments,
        })))
    }
}

#[derive(Default)]
struct LauncherState {
    scripts: Mutex<VecDeque<FakeScript>>,
    launches: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Counts one live fake server for as long as its task holds it
struct LiveGuard(Arc<LauncherState>);

impl LiveGuard {
    fn new(state: Arc<LauncherState>) -> Self {
        let live = state.live.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_live.fetch_max(live, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Launcher that runs each server as a tower-lsp service on a duplex pipe.
///
/// Scripts are used in order; the last one is reused for later launches.
#[derive(Clone)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    pub fn new(scripts: Vec<FakeScript>) -> Self {
        let state = LauncherState {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn with_commands(commands: &[&str]) -> Self {
        Self::new(vec![FakeScript::with_commands(commands)])
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Kills every server task, as if the processes died.
    pub fn crash_all(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn next_script(&self) -> FakeScript {
        let mut scripts = self.state.scripts.lock().unwrap();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or_default()
        } else {
            scripts.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, endpoint: &Endpoint) -> std::result::Result<ProcessHandle, SpawnError> {
        if let Endpoint::Spawn(spec) = endpoint {
            if spec.command == MISSING_COMMAND {
                return Err(SpawnError::NotFound {
                    command: spec.command.clone(),
                });
            }
        }

        let instance = self.state.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let script = self.next_script();
        let guard = LiveGuard::new(self.state.clone());

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let (read, write) = tokio::io::split(server_io);
            let (service, socket) = LspService::new(move |client| FakeServer {
                client,
                instance,
                script,
            });
            Server::new(read, write, socket).serve(service).await;
        });
        self.state.tasks.lock().unwrap().push(task.abort_handle());

        Ok(ProcessHandle::from_task(
            format!("{} #{}", FAKE_SERVER_NAME, instance),
            client_read,
            client_write,
            task,
        ))
    }
}

/// Settings with short timeouts suitable for tests
pub fn test_settings(command: &str) -> SessionSettings {
    let mut settings = SessionSettings::new(Endpoint::Spawn(SpawnSpec::new(command)));
    settings.initialize_timeout = Duration::from_secs(2);
    settings.request_timeout = Duration::from_secs(2);
    settings.shutdown_timeout = Duration::from_millis(500);
    settings.kill_grace = Duration::from_millis(500);
    settings
}

/// Waits for an event matching `predicate`, failing the test after 5 seconds.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ServerEvent>, mut predicate: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

pub fn is_state(event: &ServerEvent, wanted: SessionState) -> bool {
    matches!(event, ServerEvent::StateChanged { state, .. } if *state == wanted)
}

/// States published for `session`, in order, from events already received
pub fn drain_states(events: &mut broadcast::Receiver<ServerEvent>, session: SessionId) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ServerEvent::StateChanged { session: id, state } = event {
            if id == session {
                states.push(state);
            }
        }
    }
    states
}
