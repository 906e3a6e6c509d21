//! Turns external change events into debounced start/restart calls

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::session::{Capabilities, SessionError, SessionManager};
use crate::trigger::Trigger;
use crate::trigger::selector::DocumentSelector;

/// The part of the manager the router drives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn start(&self) -> Result<Arc<Capabilities>, SessionError>;
    async fn restart(&self) -> Result<Arc<Capabilities>, SessionError>;
    /// A session was asked for and not explicitly stopped since, whether it
    /// is running, failed or crashed
    fn has_session(&self) -> bool;
}

#[async_trait]
impl SessionControl for SessionManager {
    async fn start(&self) -> Result<Arc<Capabilities>, SessionError> {
        SessionManager::start(self).await
    }

    async fn restart(&self) -> Result<Arc<Capabilities>, SessionError> {
        SessionManager::restart(self).await
    }

    fn has_session(&self) -> bool {
        SessionManager::has_session(self)
    }
}

/// What a single trigger asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Restart at the end of the debounce window
    Restart,
    RestartNow,
    Start,
    Ignore,
}

/// The settings the router routes by
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub selector: DocumentSelector,
    pub restart_keys: Vec<String>,
    pub debounce: Duration,
}

pub struct TriggerRouter {
    control: Arc<dyn SessionControl>,
    updates: watch::Receiver<RouterSettings>,
    settings: RouterSettings,
    actions: JoinSet<()>,
}

impl TriggerRouter {
    /// Routes by the latest value of `updates`; it is re-read before each trigger.
    pub fn new(control: Arc<dyn SessionControl>, mut updates: watch::Receiver<RouterSettings>) -> Self {
        let settings = updates.borrow_and_update().clone();
        Self {
            control,
            updates,
            settings,
            actions: JoinSet::new(),
        }
    }

    /// Consumes triggers until the channel closes.
    ///
    /// A restart still waiting for its window fires on close, and in-flight
    /// actions are awaited before returning.
    pub async fn run(mut self, mut triggers: mpsc::Receiver<Trigger>) {
        let mut window: Option<Instant> = None;

        loop {
            let trigger = match window {
                Some(deadline) => tokio::select! {
                    trigger = triggers.recv() => trigger,
                    _ = tokio::time::sleep_until(deadline) => {
                        window = None;
                        self.spawn_restart("debounced change");
                        continue;
                    }
                },
                None => triggers.recv().await,
            };
            let Some(trigger) = trigger else {
                break;
            };
            self.refresh_settings();

            match self.route(&trigger) {
                Action::Restart if window.is_some() => {
                    debug!("Coalescing {:?} into pending restart", trigger);
                }
                Action::Restart => {
                    debug!("{:?} opens a {:?} restart window", trigger, self.settings.debounce);
                    window = Some(Instant::now() + self.settings.debounce);
                }
                Action::RestartNow => {
                    window = None;
                    self.spawn_restart("user request");
                }
                Action::Start if window.is_some() => {
                    debug!("Restart pending, not starting for {:?}", trigger);
                }
                Action::Start => self.spawn_start(),
                Action::Ignore => debug!("Ignoring {:?}", trigger),
            }

            self.reap_finished();
        }

        if window.is_some() {
            self.spawn_restart("debounced change");
        }
        while let Some(result) = self.actions.join_next().await {
            settle_action(result);
        }
        debug!("Trigger router stopped");
    }

    fn route(&self, trigger: &Trigger) -> Action {
        match trigger {
            Trigger::ConfigChanged { keys } if keys.iter().any(|key| self.is_restart_key(key)) => {
                Action::Restart
            }
            Trigger::ConfigChanged { .. } => Action::Ignore,
            Trigger::EnvironmentChanged => Action::Restart,
            Trigger::DocumentOpened { uri, language_id } if self.settings.selector.matches(uri, language_id) => {
                // Only the first matching document starts the server; after a
                // crash or failed start it takes an explicit start or restart
                if self.control.has_session() {
                    Action::Ignore
                } else {
                    Action::Start
                }
            }
            Trigger::DocumentOpened { .. } => Action::Ignore,
            Trigger::UserRestart => Action::RestartNow,
        }
    }

    fn refresh_settings(&mut self) {
        // An error means the sender is gone; keep routing by the last value
        if self.updates.has_changed().unwrap_or(false) {
            self.settings = self.updates.borrow_and_update().clone();
            debug!(
                "Router now restarts on {:?} with a {:?} window",
                self.settings.restart_keys, self.settings.debounce
            );
        }
    }

    /// `key` equals a restart key or is nested under one (`server.args`)
    fn is_restart_key(&self, key: &str) -> bool {
        self.settings.restart_keys.iter().any(|restart| {
            key == restart
                || key
                    .strip_prefix(restart.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn spawn_restart(&mut self, reason: &'static str) {
        let control = self.control.clone();
        info!("Restarting language server ({})", reason);
        self.actions.spawn(async move {
            match control.restart().await {
                Ok(capabilities) => info!("Restarted {}", capabilities.server_label()),
                Err(SessionError::Superseded) => debug!("Restart superseded"),
                Err(e) => error!("Restart failed: {}", e),
            }
        });
    }

    fn spawn_start(&mut self) {
        let control = self.control.clone();
        self.actions.spawn(async move {
            match control.start().await {
                Ok(capabilities) => debug!("{} is running", capabilities.server_label()),
                Err(e) => error!("Start failed: {}", e),
            }
        });
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.actions.try_join_next() {
            settle_action(result);
        }
    }
}

fn settle_action(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => warn!("Trigger action cancelled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::selector::DocumentFilter;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn python_settings() -> RouterSettings {
        RouterSettings {
            selector: DocumentSelector::compile(&[DocumentFilter {
                language: Some("python".to_string()),
                ..Default::default()
            }])
            .unwrap(),
            restart_keys: vec!["server".to_string(), "client".to_string()],
            debounce: Duration::from_millis(250),
        }
    }

    fn router(control: MockSessionControl) -> TriggerRouter {
        let (_, updates) = watch::channel(python_settings());
        TriggerRouter::new(Arc::new(control), updates)
    }

    fn config_changed(keys: &[&str]) -> Trigger {
        Trigger::ConfigChanged {
            keys: keys.iter().map(|key| key.to_string()).collect(),
        }
    }

    fn opened(uri: &str, language_id: &str) -> Trigger {
        Trigger::DocumentOpened {
            uri: uri.to_string(),
            language_id: language_id.to_string(),
        }
    }

    #[rstest]
    #[case(config_changed(&["server"]), Action::Restart)]
    #[case(config_changed(&["server.args"]), Action::Restart)]
    #[case(config_changed(&["editor.fontSize", "client.documentSelector"]), Action::Restart)]
    #[case(config_changed(&["serverless"]), Action::Ignore)]
    #[case(config_changed(&["debounceMs"]), Action::Ignore)]
    #[case(Trigger::EnvironmentChanged, Action::Restart)]
    #[case(Trigger::UserRestart, Action::RestartNow)]
    #[case(opened("file:///work/main.py", "python"), Action::Start)]
    #[case(opened("file:///work/main.rs", "rust"), Action::Ignore)]
    fn route_maps_triggers_to_actions(#[case] trigger: Trigger, #[case] expected: Action) {
        let mut control = MockSessionControl::new();
        control.expect_has_session().return_const(false);
        let router = router(control);

        assert_eq!(router.route(&trigger), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_collapses_into_one_restart() {
        let mut control = MockSessionControl::new();
        control
            .expect_restart()
            .times(1)
            .returning(|| Err(SessionError::Stopped));
        control.expect_start().never();

        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(router(control).run(rx));

        tx.send(config_changed(&["server.command"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(config_changed(&["server.args"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Trigger::EnvironmentChanged).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        drop(tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn changes_in_separate_windows_restart_separately() {
        let mut control = MockSessionControl::new();
        control
            .expect_restart()
            .times(2)
            .returning(|| Err(SessionError::Stopped));

        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(router(control).run(rx));

        tx.send(config_changed(&["server"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(config_changed(&["client"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        drop(tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn user_restart_fires_immediately_and_closes_window() {
        let mut control = MockSessionControl::new();
        control
            .expect_restart()
            .times(1)
            .returning(|| Err(SessionError::Stopped));

        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(router(control).run(rx));

        tx.send(config_changed(&["server"])).await.unwrap();
        tx.send(Trigger::UserRestart).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        drop(tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn matching_document_starts_unless_restart_pending() {
        let mut control = MockSessionControl::new();
        control.expect_has_session().return_const(false);
        control
            .expect_start()
            .times(1)
            .returning(|| Err(SessionError::Stopped));
        control
            .expect_restart()
            .times(1)
            .returning(|| Err(SessionError::Stopped));

        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(router(control).run(rx));

        tx.send(opened("file:///work/main.py", "python")).await.unwrap();
        tx.send(opened("file:///work/main.rs", "rust")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(config_changed(&["server"])).await.unwrap();
        tx.send(opened("file:///work/other.py", "python")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        drop(tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_restart_fires_when_channel_closes() {
        let mut control = MockSessionControl::new();
        control
            .expect_restart()
            .times(1)
            .returning(|| Err(SessionError::Stopped));

        let (tx, rx) = mpsc::channel(16);
        tx.send(Trigger::EnvironmentChanged).await.unwrap();
        drop(tx);

        router(control).run(rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn opened_document_does_not_revive_existing_session() {
        let mut control = MockSessionControl::new();
        // Crashed or failed sessions still count until stopped
        control.expect_has_session().return_const(true);
        control.expect_start().never();
        control.expect_restart().never();

        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(router(control).run(rx));

        tx.send(opened("file:///work/main.py", "python")).await.unwrap();
        tx.send(opened("file:///work/util.py", "python")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(tx);
        running.await.unwrap();
    }

    #[test]
    fn route_ignores_matching_document_while_session_exists() {
        let mut control = MockSessionControl::new();
        control.expect_has_session().times(1).return_const(true);
        let router = router(control);

        assert_eq!(router.route(&opened("file:///work/main.py", "python")), Action::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn settings_updates_apply_to_later_triggers() {
        let restarts = Arc::new(AtomicUsize::new(0));
        let mut control = MockSessionControl::new();
        control.expect_has_session().return_const(false);
        control
            .expect_start()
            .times(1)
            .returning(|| Err(SessionError::Stopped));
        let counted = restarts.clone();
        control.expect_restart().times(1).returning(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Stopped)
        });

        let (settings, updates) = watch::channel(python_settings());
        let (tx, rx) = mpsc::channel(16);
        let running = tokio::spawn(TriggerRouter::new(Arc::new(control), updates).run(rx));

        tx.send(opened("file:///work/main.rs", "rust")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        settings.send_replace(RouterSettings {
            selector: DocumentSelector::compile(&[DocumentFilter {
                language: Some("rust".to_string()),
                ..Default::default()
            }])
            .unwrap(),
            restart_keys: vec!["timeouts".to_string()],
            debounce: Duration::from_millis(100),
        });
        tx.send(opened("file:///work/main.rs", "rust")).await.unwrap();
        tx.send(config_changed(&["server.args"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(config_changed(&["timeouts.requestMs"])).await.unwrap();
        // The new window is shorter than the old 250ms one
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);

        drop(tx);
        running.await.unwrap();
    }
}
