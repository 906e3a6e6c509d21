use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use easyergo_client::config::{ServerMode, Settings};
use easyergo_client::host::Host;
use easyergo_client::log;
use easyergo_client::process::SystemLauncher;
use easyergo_client::session::SessionManager;
use easyergo_client::trigger::TriggerRouter;

#[derive(Parser, Debug)]
#[command(name = "easyergo-client", version, about = "Runs and supervises the EasyErgo language server")]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/easyergo-client/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server executable; replaces the configured command and arguments
    #[arg(long)]
    command: Option<String>,

    /// Server argument (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Working directory of the server
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Connect to a running server instead of spawning one
    #[arg(long, value_name = "HOST:PORT", value_parser = parse_tcp_address)]
    tcp: Option<(String, u16)>,

    /// Also log to stderr
    #[arg(long)]
    log_stderr: bool,

    /// Wait for `start` or a matching `open` instead of starting right away
    #[arg(long)]
    no_start: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(command) = &self.command {
            settings.server.command = command.clone();
            settings.server.args = self.args.clone();
        } else if !self.args.is_empty() {
            settings.server.args = self.args.clone();
        }
        if let Some(cwd) = &self.cwd {
            settings.server.cwd = Some(cwd.clone());
        }
        if let Some((host, port)) = &self.tcp {
            settings.server.mode = ServerMode::Tcp;
            settings.server.host = host.clone();
            settings.server.port = *port;
        }
    }
}

fn parse_tcp_address(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{}'", value))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port '{}': {}", port, e))?;
    if host.is_empty() {
        return Err("host must not be empty".to_string());
    }
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = log::init(cli.log_stderr)?;

    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    let (router_settings, router_updates) = watch::channel(settings.router_settings()?);

    info!("Starting easyergo-client {}", env!("CARGO_PKG_VERSION"));

    let manager = SessionManager::new(Arc::new(SystemLauncher), settings.session_settings());
    let (triggers, trigger_rx) = mpsc::channel(64);
    let router = TriggerRouter::new(Arc::new(manager.clone()), router_updates);
    let routing = tokio::spawn(router.run(trigger_rx));

    if !cli.no_start {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                error!("Initial start failed: {}", e);
            }
        });
    }

    let mut host = Host::new(manager.clone(), settings, triggers, router_settings);
    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = host.run(stdin, tokio::io::stdout()) => result?,
        _ = shutdown_signal() => info!("Received shutdown signal"),
    }

    drop(host);
    routing.abort();
    manager.stop().await;

    info!("easyergo-client stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
