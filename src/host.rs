//! Line-oriented command shell standing in for the editor host

use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::session::{RequestError, ServerEvent, SessionManager, SessionState};
use crate::trigger::{RouterSettings, Trigger};

const HELP: &str = "\
Commands:
  start                     start the language server
  stop                      stop the language server
  restart                   restart the language server
  status                    show the current session
  caps                      show server capabilities
  exec [name] [json-args]   run a server command (no name lists commands)
  open <uri> [language]     report an opened document
  set <key> <json>          change a setting, e.g. set server.args [\"-m\",\"easyergo.cli\"]
  env                       report an environment change
  help                      show this help
  quit                      exit";

#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Start,
    Stop,
    Restart,
    Status,
    Capabilities,
    Execute {
        command: Option<String>,
        arguments: Vec<Value>,
    },
    Open {
        uri: String,
        language_id: String,
    },
    Set {
        key: String,
        value: Value,
    },
    EnvironmentChanged,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown command '{0}'. Type 'help' for a list of commands.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid JSON: {0}")]
    Json(String),
}

impl FromStr for HostCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "start" => Ok(HostCommand::Start),
            "stop" => Ok(HostCommand::Stop),
            "restart" => Ok(HostCommand::Restart),
            "status" => Ok(HostCommand::Status),
            "caps" => Ok(HostCommand::Capabilities),
            "env" => Ok(HostCommand::EnvironmentChanged),
            "help" => Ok(HostCommand::Help),
            "quit" | "exit" => Ok(HostCommand::Quit),
            "exec" => parse_exec(rest),
            "open" => parse_open(rest),
            "set" => parse_set(rest),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_json(text: &str) -> Result<Value, ParseError> {
    serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))
}

fn parse_exec(rest: &str) -> Result<HostCommand, ParseError> {
    if rest.is_empty() {
        return Ok(HostCommand::Execute {
            command: None,
            arguments: Vec::new(),
        });
    }

    let (command, arguments) = match rest.split_once(char::is_whitespace) {
        Some((command, json)) => {
            let arguments = match parse_json(json.trim())? {
                Value::Array(items) => items,
                single => vec![single],
            };
            (command, arguments)
        }
        None => (rest, Vec::new()),
    };

    Ok(HostCommand::Execute {
        command: Some(command.to_string()),
        arguments,
    })
}

fn parse_open(rest: &str) -> Result<HostCommand, ParseError> {
    let mut parts = rest.split_whitespace();
    let Some(uri) = parts.next() else {
        return Err(ParseError::Usage("open <uri> [language]"));
    };
    let language_id = parts
        .next()
        .map(String::from)
        .unwrap_or_else(|| guess_language(uri).to_string());

    Ok(HostCommand::Open {
        uri: uri.to_string(),
        language_id,
    })
}

fn parse_set(rest: &str) -> Result<HostCommand, ParseError> {
    let Some((key, json)) = rest.split_once(char::is_whitespace) else {
        return Err(ParseError::Usage("set <key> <json>"));
    };

    Ok(HostCommand::Set {
        key: key.to_string(),
        value: parse_json(json.trim())?,
    })
}

fn guess_language(uri: &str) -> &'static str {
    match uri.rsplit_once('.').map(|(_, extension)| extension) {
        Some("py" | "pyi" | "pyw") => "python",
        Some("ipynb") => "jupyter",
        _ => "plaintext",
    }
}

/// Executes host commands against the manager and the trigger router.
pub struct Host {
    manager: SessionManager,
    settings: Settings,
    triggers: mpsc::Sender<Trigger>,
    router_settings: watch::Sender<RouterSettings>,
}

impl Host {
    pub fn new(
        manager: SessionManager,
        settings: Settings,
        triggers: mpsc::Sender<Trigger>,
        router_settings: watch::Sender<RouterSettings>,
    ) -> Self {
        Self {
            manager,
            settings,
            triggers,
            router_settings,
        }
    }

    /// Reads commands from `input` until EOF or `quit`, echoing replies and
    /// server events to `output`.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut events = self.manager.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match line.parse::<HostCommand>() {
                        Ok(HostCommand::Quit) => break,
                        Ok(command) => self.handle(command).await,
                        Err(e) => e.to_string(),
                    };
                    write_line(&mut output, &reply).await?;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(text) = describe_event(&event) {
                            write_line(&mut output, &text).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!("Host missed {} server events", skipped),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }

    /// Runs one command and returns the text to show.
    pub async fn handle(&mut self, command: HostCommand) -> String {
        debug!("Host command: {:?}", command);
        match command {
            HostCommand::Start => match self.manager.start().await {
                Ok(capabilities) => format!("{} is running", capabilities.server_label()),
                Err(e) => format!("Failed to start language server: {}", e),
            },
            HostCommand::Stop => {
                self.manager.stop().await;
                "Language server stopped".to_string()
            }
            HostCommand::Restart => self.emit(Trigger::UserRestart, "Restart requested").await,
            HostCommand::Status => match self.manager.status() {
                Some(status) => format!(
                    "Session {} {} (started {})",
                    status.id,
                    status.state,
                    status.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => "No language server session".to_string(),
            },
            HostCommand::Capabilities => match self.manager.current_capabilities() {
                Some(capabilities) => {
                    let commands: Vec<&str> = capabilities.commands().iter().map(String::as_str).collect();
                    let features: Vec<&str> = capabilities.features().iter().map(String::as_str).collect();
                    format!(
                        "{}\n  commands: {}\n  features: {}",
                        capabilities.server_label(),
                        list_or_none(&commands),
                        list_or_none(&features)
                    )
                }
                None => RequestError::NoActiveSession.to_string(),
            },
            HostCommand::Execute { command: None, .. } => self.list_commands(),
            HostCommand::Execute {
                command: Some(command),
                arguments,
            } => match self.manager.execute_command(&command, arguments).await {
                Ok(result) => serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string()),
                Err(e) => e.to_string(),
            },
            HostCommand::Open { uri, language_id } => {
                let reply = format!("Opened {} ({})", uri, language_id);
                self.emit(Trigger::DocumentOpened { uri, language_id }, &reply)
                    .await
            }
            HostCommand::Set { key, value } => {
                if let Err(e) = self.settings.set(&key, value) {
                    return e.to_string();
                }
                self.manager
                    .update_settings(self.settings.session_settings());
                // Published before the change event so the router routes it by the new settings
                match self.settings.router_settings() {
                    Ok(router_settings) => {
                        self.router_settings.send_replace(router_settings);
                    }
                    Err(e) => warn!("Keeping previous router settings: {}", e),
                }
                let reply = format!("Updated {}", key);
                self.emit(Trigger::ConfigChanged { keys: vec![key] }, &reply)
                    .await
            }
            HostCommand::EnvironmentChanged => {
                self.emit(Trigger::EnvironmentChanged, "Environment change reported")
                    .await
            }
            HostCommand::Help => HELP.to_string(),
            HostCommand::Quit => String::new(),
        }
    }

    fn list_commands(&self) -> String {
        let Some(capabilities) = self.manager.current_capabilities() else {
            return RequestError::NoActiveSession.to_string();
        };
        if capabilities.commands().is_empty() {
            return RequestError::NoCommands {
                server: capabilities.server_label(),
            }
            .to_string();
        }
        capabilities
            .commands()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn emit(&self, trigger: Trigger, reply: &str) -> String {
        match self.triggers.send(trigger).await {
            Ok(()) => reply.to_string(),
            Err(_) => "Trigger router is not running".to_string(),
        }
    }
}

fn list_or_none(items: &[&str]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn describe_event(event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::StateChanged {
            session,
            state: state @ (SessionState::Running | SessionState::Stopped | SessionState::Failed(_)),
        } => Some(format!("Session {} {}", session, state)),
        ServerEvent::StateChanged { .. } => None,
        ServerEvent::Crashed { session, exit } => Some(match exit {
            Some(exit) => format!("Language server session {} crashed ({})", session, exit),
            None => format!("Language server session {} crashed", session),
        }),
        ServerEvent::Notification {
            notification, ..
        } if notification.method == "window/showMessage" => notification
            .params
            .as_ref()
            .and_then(|params| params.get("message"))
            .and_then(Value::as_str)
            .map(|message| format!("[server] {}", message)),
        ServerEvent::Notification { .. } => None,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> std::io::Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
