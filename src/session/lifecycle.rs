//! One server lifetime: launch, initialize, run, shut down

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{
    ClientCapabilities, ClientInfo, ExecuteCommandClientCapabilities, InitializeParams,
    InitializeResult, PublishDiagnosticsClientCapabilities, TextDocumentClientCapabilities,
    TextDocumentSyncClientCapabilities, Url, WindowClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceFolder,
};
use tracing::{debug, error, info, warn};

use crate::process::{Launcher, ProcessExit};
use crate::rpc::Notification;
use crate::session::error::{SessionError, TransportError};
use crate::session::transport::TransportSession;
use crate::session::types::{Capabilities, ServerEvent, SessionId, SessionSettings, SessionState};

pub const CLIENT_NAME: &str = "easyergo-client";

/// A single server lifetime.
///
/// One driver task walks the session through its states; everything else
/// only observes the state channel or asks the driver to stop.
pub struct Session {
    id: SessionId,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    /// Why the session was aborted before it reached Running
    abort_reason: OnceLock<SessionError>,
    transport: OnceLock<Arc<TransportSession>>,
    capabilities: OnceLock<Arc<Capabilities>>,
}

impl Session {
    /// Launches the server described by `settings` and drives it in the background.
    pub fn launch(
        id: SessionId,
        launcher: Arc<dyn Launcher>,
        settings: SessionSettings,
        events: broadcast::Sender<ServerEvent>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let session = Arc::new(Self {
            id,
            started_at: Utc::now(),
            state: state_rx,
            cancel: CancellationToken::new(),
            abort_reason: OnceLock::new(),
            transport: OnceLock::new(),
            capabilities: OnceLock::new(),
        });

        let _ = events.send(ServerEvent::StateChanged {
            session: id,
            state: SessionState::Starting,
        });

        let driver = Driver {
            session: session.clone(),
            state: state_tx,
            launcher,
            settings,
            events,
        };
        tokio::spawn(driver.run());

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Capabilities, once the server has initialized
    pub fn capabilities(&self) -> Option<Arc<Capabilities>> {
        self.capabilities.get().cloned()
    }

    pub fn transport(&self) -> Option<Arc<TransportSession>> {
        self.transport.get().cloned()
    }

    /// Waits until the session is Running or has given up on starting.
    pub async fn wait_ready(&self) -> Result<Arc<Capabilities>, SessionError> {
        let mut state = self.state.clone();
        let settled = match state.wait_for(|state| !state.is_starting()).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Stopped,
        };

        match settled {
            SessionState::Running => self.capabilities().ok_or(SessionError::Stopped),
            SessionState::Failed(error) => Err(error),
            _ => Err(SessionError::Stopped),
        }
    }

    /// Waits for Stopped or Failed.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut state = self.state.clone();
        match state.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Stopped,
        }
    }

    /// Stops the session and waits until its server is gone.
    pub async fn stop(&self) {
        self.abort(SessionError::Stopped);
        self.wait_terminal().await;
    }

    /// Aborts the session; a start in progress fails with `reason`.
    pub fn abort(&self, reason: SessionError) {
        let _ = self.abort_reason.set(reason);
        self.cancel.cancel();
    }
}

enum StopCause {
    Requested,
    ServerGone,
}

struct Driver {
    session: Arc<Session>,
    state: watch::Sender<SessionState>,
    launcher: Arc<dyn Launcher>,
    settings: SessionSettings,
    events: broadcast::Sender<ServerEvent>,
}

impl Driver {
    async fn run(self) {
        let Some(transport) = self.start().await else {
            return;
        };

        let cause = tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => StopCause::Requested,
            _ = transport.closed() => StopCause::ServerGone,
            _ = transport.wait_exit() => StopCause::ServerGone,
        };

        self.transition(SessionState::Stopping);
        match cause {
            StopCause::Requested => self.shut_down(&transport).await,
            StopCause::ServerGone => self.reap(&transport).await,
        }
    }

    /// Publishes the event before the state, so anyone woken by the state
    /// change can already receive the event.
    fn transition(&self, next: SessionState) {
        debug!("Session {}: {} -> {}", self.session.id, *self.state.borrow(), next);
        let _ = self.events.send(ServerEvent::StateChanged {
            session: self.session.id,
            state: next.clone(),
        });
        self.state.send_replace(next);
    }

    fn fail(&self, error: SessionError) {
        match error {
            SessionError::Superseded | SessionError::Stopped => {
                info!("Session {} aborted: {}", self.session.id, error)
            }
            _ => error!("Session {} failed to start: {}", self.session.id, error),
        }
        self.transition(SessionState::Failed(error));
    }

    fn abort_reason(&self) -> SessionError {
        self.session
            .abort_reason
            .get()
            .cloned()
            .unwrap_or(SessionError::Stopped)
    }

    /// Starting -> Initializing -> Running, or Failed
    async fn start(&self) -> Option<Arc<TransportSession>> {
        info!(
            "Starting language server session {} ({})",
            self.session.id, self.settings.endpoint
        );

        let launched = tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => {
                self.fail(self.abort_reason());
                return None;
            }
            launched = self.launcher.launch(&self.settings.endpoint) => launched,
        };
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(SessionError::Spawn(e));
                return None;
            }
        };

        let transport = Arc::new(TransportSession::new(handle, self.settings.request_timeout));
        let _ = self.session.transport.set(transport.clone());
        self.forward_notifications(&transport);
        self.transition(SessionState::Initializing);

        let initialized = tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => Err(self.abort_reason()),
            result = self.initialize(&transport) => result,
        };

        match initialized {
            Ok(capabilities) => {
                info!(
                    "Session {} running {} with {} command(s)",
                    self.session.id,
                    capabilities.server_label(),
                    capabilities.commands().len()
                );
                let _ = self.session.capabilities.set(capabilities);
                self.transition(SessionState::Running);
                Some(transport)
            }
            Err(error) => {
                // The process must be gone before anyone sees Failed
                transport.close(Duration::ZERO).await;
                self.fail(error);
                None
            }
        }
    }

    async fn initialize(&self, transport: &TransportSession) -> Result<Arc<Capabilities>, SessionError> {
        let timeout = self.settings.initialize_timeout;
        let params = serde_json::to_value(initialize_params(&self.settings))
            .map_err(|e| SessionError::Initialize(e.to_string()))?;

        let result = match transport
            .request_with_timeout("initialize", Some(params), timeout)
            .await
        {
            Ok(result) => result,
            Err(TransportError::Timeout { .. }) => return Err(SessionError::InitializeTimeout(timeout)),
            Err(TransportError::Server(error)) => return Err(SessionError::Initialize(error.message)),
            Err(TransportError::Protocol(reason)) => return Err(SessionError::Initialize(reason)),
            Err(TransportError::SessionClosed) => {
                return Err(SessionError::ExitedDuringStartup(
                    self.startup_exit(transport).await,
                ));
            }
        };

        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| SessionError::Initialize(format!("malformed initialize result: {}", e)))?;

        if transport.notify("initialized", Some(json!({}))).await.is_err() {
            return Err(SessionError::ExitedDuringStartup(
                self.startup_exit(transport).await,
            ));
        }

        Ok(Arc::new(Capabilities::from_initialize_result(result)))
    }

    /// Exit status of a server that went away during startup, if it shows up in time
    async fn startup_exit(&self, transport: &TransportSession) -> Option<ProcessExit> {
        tokio::time::timeout(self.settings.kill_grace, transport.wait_exit())
            .await
            .ok()
    }

    fn forward_notifications(&self, transport: &TransportSession) {
        let Some(mut notifications) = transport.take_notifications() else {
            return;
        };
        let events = self.events.clone();
        let session = self.session.id;

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                log_server_notification(session, &notification);
                let _ = events.send(ServerEvent::Notification {
                    session,
                    notification,
                });
            }
        });
    }

    /// Orderly stop: shutdown, exit, then terminate what is left.
    async fn shut_down(&self, transport: &TransportSession) {
        info!("Stopping language server session {}", self.session.id);

        match transport
            .request_with_timeout("shutdown", None, self.settings.shutdown_timeout)
            .await
        {
            Ok(_) => {
                if let Err(e) = transport.notify("exit", None).await {
                    debug!("Failed to send exit to session {}: {}", self.session.id, e);
                }
            }
            Err(e) => warn!("Shutdown of session {} failed: {}", self.session.id, e),
        }

        let exit = transport.close(self.settings.kill_grace).await;
        info!("Language server session {} stopped ({})", self.session.id, exit);
        self.transition(SessionState::Stopped);
    }

    /// The server went away on its own while Running.
    async fn reap(&self, transport: &TransportSession) {
        let exit = transport.close(self.settings.kill_grace).await;
        error!("Language server session {} crashed ({})", self.session.id, exit);
        self.transition(SessionState::Stopped);
        let _ = self.events.send(ServerEvent::Crashed {
            session: self.session.id,
            exit: Some(exit),
        });
    }
}

fn log_server_notification(session: SessionId, notification: &Notification) {
    match notification.method.as_str() {
        "window/logMessage" | "window/showMessage" => {
            let message = notification
                .params
                .as_ref()
                .and_then(|params| params.get("message"))
                .and_then(|message| message.as_str())
                .unwrap_or_default();
            debug!("[server {}] {}", session, message);
        }
        method => debug!("Session {} notification: {}", session, method),
    }
}

#[allow(deprecated)]
fn initialize_params(settings: &SessionSettings) -> InitializeParams {
    let root = settings
        .root
        .as_deref()
        .and_then(|root| std::path::absolute(root).ok());
    let root_uri = root.as_deref().and_then(|root| Url::from_file_path(root).ok());
    let workspace_folders = match (&root, &root_uri) {
        (Some(root), Some(uri)) => Some(vec![WorkspaceFolder {
            uri: uri.clone(),
            name: root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string()),
        }]),
        _ => None,
    };

    InitializeParams {
        process_id: Some(std::process::id()),
        root_uri,
        initialization_options: settings.initialization_options.clone(),
        capabilities: client_capabilities(),
        workspace_folders,
        client_info: Some(ClientInfo {
            name: CLIENT_NAME.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            execute_command: Some(ExecuteCommandClientCapabilities {
                dynamic_registration: Some(false),
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
