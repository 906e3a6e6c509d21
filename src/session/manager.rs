//! Owns the current session and serializes everything that replaces it

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tower_lsp::lsp_types::ExecuteCommandParams;
use tracing::{debug, info};

use crate::process::Launcher;
use crate::session::error::{RequestError, SessionError};
use crate::session::lifecycle::Session;
use crate::session::types::{
    Capabilities, ServerEvent, SessionId, SessionSettings, SessionState, SessionStatus,
};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

type StartOutcome = Result<Arc<Capabilities>, SessionError>;

/// Outcome of the most recent restart sequence and the request it covered
struct Settled {
    generation: u64,
    outcome: StartOutcome,
}

struct Inner {
    launcher: Arc<dyn Launcher>,
    settings: RwLock<SessionSettings>,
    current: RwLock<Option<Arc<Session>>>,
    /// Held for the whole of a start, restart or stop sequence
    sequence: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
    /// Set by every launch, cleared by `stop`
    engaged: AtomicBool,
    restarts_requested: AtomicU64,
    restarts_settled: Mutex<Settled>,
    events: broadcast::Sender<ServerEvent>,
}

/// Client-side owner of the language server.
///
/// At most one session is current, and at most one server is alive: the old
/// one is fully stopped before its replacement is launched. Concurrent
/// restarts coalesce; every caller gets the outcome of a sequence that
/// started after its own request.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn Launcher>, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                settings: RwLock::new(settings),
                current: RwLock::new(None),
                sequence: tokio::sync::Mutex::new(()),
                next_session: AtomicU64::new(0),
                engaged: AtomicBool::new(false),
                restarts_requested: AtomicU64::new(0),
                restarts_settled: Mutex::new(Settled {
                    generation: 0,
                    outcome: Err(SessionError::Stopped),
                }),
                events,
            }),
        }
    }

    /// Starts a session unless one is starting or running; then waits for it.
    ///
    /// A session still winding down is waited out before the new one launches.
    pub async fn start(&self) -> StartOutcome {
        loop {
            let _sequence = self.inner.sequence.lock().await;
            let outcome = match self.live_session() {
                Some(session) if session.state() == SessionState::Stopping => {
                    debug!("Waiting for session {} to stop before starting", session.id());
                    session.wait_terminal().await;
                    self.launch_into_slot().await
                }
                Some(session) => session.wait_ready().await,
                None => self.launch_into_slot().await,
            };

            match outcome {
                // A restart took over; its session is the one to wait for
                Err(SessionError::Superseded) => continue,
                outcome => return outcome,
            }
        }
    }

    /// Stops the current session, if any, then starts a fresh one.
    ///
    /// Restarts requested while one is in flight are coalesced: the start in
    /// progress is aborted and a single new sequence serves all of them.
    pub async fn restart(&self) -> StartOutcome {
        let ticket = self.inner.restarts_requested.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_pending_start(SessionError::Superseded);

        loop {
            let _sequence = self.inner.sequence.lock().await;
            let latest = self.inner.restarts_requested.load(Ordering::SeqCst);
            if let Some(outcome) = self.settled_outcome(ticket, latest) {
                return outcome;
            }

            if let Some(previous) = self.take_current() {
                info!("Stopping session {} for restart", previous.id());
                previous.stop().await;
            }
            // Requests that arrived during teardown are served by this launch too
            let covered = self.inner.restarts_requested.load(Ordering::SeqCst);
            debug!("Restart sequence for requests {}..={}", ticket, covered);
            let outcome = self.launch_into_slot().await;
            self.settle(covered, outcome);
        }
    }

    /// Stops the current session. Idempotent; pending restarts resolve as stopped.
    pub async fn stop(&self) {
        self.abort_pending_start(SessionError::Stopped);

        let _sequence = self.inner.sequence.lock().await;
        let latest = self.inner.restarts_requested.load(Ordering::SeqCst);
        {
            let mut settled = self.settled();
            if settled.generation < latest {
                *settled = Settled {
                    generation: latest,
                    outcome: Err(SessionError::Stopped),
                };
            }
        }

        self.inner.engaged.store(false, Ordering::SeqCst);
        if let Some(session) = self.take_current() {
            if !session.state().is_terminal() {
                info!("Stopping session {}", session.id());
            }
            session.stop().await;
        }
    }

    /// Whether a session was launched and not stopped since.
    ///
    /// Stays true after a failed start or a crash, until `stop`.
    pub fn has_session(&self) -> bool {
        self.inner.engaged.load(Ordering::SeqCst)
    }

    /// Runs `workspace/executeCommand` on the running server.
    pub async fn execute_command(&self, command: &str, arguments: Vec<Value>) -> Result<Value, RequestError> {
        let session = self.running_session().ok_or(RequestError::NoActiveSession)?;
        let (Some(capabilities), Some(transport)) = (session.capabilities(), session.transport()) else {
            return Err(RequestError::NoActiveSession);
        };

        if capabilities.commands().is_empty() {
            return Err(RequestError::NoCommands {
                server: capabilities.server_label(),
            });
        }
        if !capabilities.supports_command(command) {
            return Err(RequestError::UnknownCommand {
                command: command.to_string(),
            });
        }

        let params = ExecuteCommandParams {
            command: command.to_string(),
            arguments,
            work_done_progress_params: Default::default(),
        };
        let params = serde_json::to_value(params).map_err(|e| RequestError::Encode(e.to_string()))?;

        info!("Executing '{}' on session {}", command, session.id());
        Ok(transport
            .request("workspace/executeCommand", Some(params))
            .await?)
    }

    /// Sends an arbitrary request to the running server.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RequestError> {
        let transport = self
            .running_session()
            .and_then(|session| session.transport())
            .ok_or(RequestError::NoActiveSession)?;
        Ok(transport.request(method, params).await?)
    }

    /// Sends a notification to the running server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RequestError> {
        let transport = self
            .running_session()
            .and_then(|session| session.transport())
            .ok_or(RequestError::NoActiveSession)?;
        Ok(transport.notify(method, params).await?)
    }

    /// Capabilities of the running server
    pub fn current_capabilities(&self) -> Option<Arc<Capabilities>> {
        self.running_session()
            .and_then(|session| session.capabilities())
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.current().map(|session| SessionStatus {
            id: session.id(),
            state: session.state(),
            started_at: session.started_at(),
        })
    }

    /// Events from every session this manager runs, current and future.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the settings used by the next start. The running session is untouched.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        std::mem::replace(
            &mut *self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            session,
        )
    }

    fn take_current(&self) -> Option<Arc<Session>> {
        self.set_current(None)
    }

    fn clear_current_if(&self, session: &Arc<Session>) {
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            *current = None;
        }
    }

    fn running_session(&self) -> Option<Arc<Session>> {
        self.current()
            .filter(|session| session.state().is_running())
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.current()
            .filter(|session| !session.state().is_terminal())
    }

    fn abort_pending_start(&self, reason: SessionError) {
        if let Some(session) = self.current() {
            if session.state().is_starting() {
                debug!("Aborting start of session {}: {}", session.id(), reason);
                session.abort(reason);
            }
        }
    }

    fn settled(&self) -> std::sync::MutexGuard<'_, Settled> {
        self.inner
            .restarts_settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The recorded outcome, if it covers both `ticket` and every later request
    fn settled_outcome(&self, ticket: u64, latest: u64) -> Option<StartOutcome> {
        let settled = self.settled();
        (settled.generation >= ticket && settled.generation >= latest).then(|| settled.outcome.clone())
    }

    fn settle(&self, generation: u64, outcome: StartOutcome) {
        let mut settled = self.settled();
        if generation >= settled.generation {
            *settled = Settled { generation, outcome };
        }
    }

    /// Caller holds `sequence`.
    async fn launch_into_slot(&self) -> StartOutcome {
        self.inner.engaged.store(true, Ordering::SeqCst);
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        let session = Session::launch(
            id,
            self.inner.launcher.clone(),
            self.settings(),
            self.inner.events.clone(),
        );
        if let Some(previous) = self.set_current(Some(session.clone())) {
            // Only terminal sessions are left in the slot at this point
            debug!("Replacing finished session {}", previous.id());
        }

        let outcome = session.wait_ready().await;
        if outcome.is_err() {
            self.clear_current_if(&session);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Endpoint, ProcessHandle, SpawnError, SpawnSpec};
    use async_trait::async_trait;

    struct MissingLauncher;

    #[async_trait]
    impl Launcher for MissingLauncher {
        async fn launch(&self, endpoint: &Endpoint) -> Result<ProcessHandle, SpawnError> {
            Err(SpawnError::NotFound {
                command: endpoint.to_string(),
            })
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(MissingLauncher),
            SessionSettings::new(Endpoint::Spawn(SpawnSpec::new("missing-server"))),
        )
    }

    #[test]
    fn session_types_can_be_shared_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<SessionManager>();
        assert_send_sync::<Session>();
        assert_send_sync::<crate::session::TransportSession>();
    }

    #[tokio::test]
    async fn calls_without_session_report_no_active_session() {
        let manager = manager();

        assert_eq!(
            manager.execute_command("foo.bar", vec![]).await,
            Err(RequestError::NoActiveSession)
        );
        assert_eq!(
            manager.request("textDocument/hover", None).await,
            Err(RequestError::NoActiveSession)
        );
        assert_eq!(
            manager.notify("workspace/didChangeConfiguration", None).await,
            Err(RequestError::NoActiveSession)
        );
        assert!(manager.current_capabilities().is_none());
        assert!(manager.status().is_none());
    }

    #[tokio::test]
    async fn failed_start_leaves_no_current_session() {
        let manager = manager();

        let result = manager.start().await;

        assert_eq!(
            result,
            Err(SessionError::Spawn(SpawnError::NotFound {
                command: "missing-server".to_string()
            }))
        );
        assert!(manager.status().is_none());
    }

    #[tokio::test]
    async fn failed_start_still_counts_as_a_session_until_stopped() {
        let manager = manager();
        assert!(!manager.has_session());

        let _ = manager.start().await;
        assert!(manager.has_session());

        manager.stop().await;
        assert!(!manager.has_session());
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let manager = manager();

        manager.stop().await;
        manager.stop().await;

        assert!(manager.status().is_none());
    }

    #[tokio::test]
    async fn update_settings_applies_to_next_start() {
        let manager = manager();
        let mut settings = manager.settings();
        settings.endpoint = Endpoint::Spawn(SpawnSpec::new("other-server"));

        manager.update_settings(settings);
        let result = manager.restart().await;

        assert_eq!(
            result,
            Err(SessionError::Spawn(SpawnError::NotFound {
                command: "other-server".to_string()
            }))
        );
    }
}
