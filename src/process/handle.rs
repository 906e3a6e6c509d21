//! Ownership of one language server process and its byte transport

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::PoisonError;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::error::SpawnError;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lazy sequence of inbound byte chunks; ends when the peer closes
pub type Inbound = ReaderStream<BoxReader>;

/// How a server process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with a status code
    Exited(i32),
    /// Terminated by a signal (Unix)
    Signaled(i32),
    /// Forcibly killed or aborted by us
    Killed,
    /// Socket connection closed; there is no process to observe
    Disconnected,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited(0))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited(code) => write!(f, "exited with code {}", code),
            ProcessExit::Signaled(signal) => write!(f, "terminated by signal {}", signal),
            ProcessExit::Killed => write!(f, "killed"),
            ProcessExit::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Command line of a server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Process,
    Task,
    Socket,
}

/// What the supervisor task waits on
enum Backing {
    Child(Child),
    Task(JoinHandle<()>),
    Socket,
}

/// One server lifetime: a child process, a socket connection, or an
/// in-process server task.
///
/// The exit signal fires exactly once. Dropping the handle kills whatever
/// is still running behind it.
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    kind: Kind,
    writer: Mutex<Option<BoxWriter>>,
    /// Behind a lock only so the handle stays `Sync`; taken once
    reader: std::sync::Mutex<Option<BoxReader>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Spawns a server process speaking the protocol over stdio.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, SpawnError> {
        if let Some(cwd) = &spec.cwd {
            check_working_directory(cwd)?;
        }

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.command, e))?;

        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("{} (pid {})", spec.command, pid),
            None => spec.command.clone(),
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SpawnError::Io {
                command: spec.command.clone(),
                reason: "stdio pipes not available".to_string(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(label.clone(), stderr));
        }

        info!("Spawned language server {}", label);
        Ok(Self::supervised(
            label,
            pid,
            Kind::Process,
            Box::new(stdout),
            Box::new(stdin),
            Backing::Child(child),
        ))
    }

    /// Connects to a server that is already listening on a TCP socket.
    pub async fn connect(host: &str, port: u16) -> Result<Self, SpawnError> {
        let address = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| SpawnError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();

        info!("Connected to language server at {}", address);
        Ok(Self::supervised(
            address,
            None,
            Kind::Socket,
            Box::new(reader),
            Box::new(writer),
            Backing::Socket,
        ))
    }

    /// Wraps a server running as a task inside this process.
    ///
    /// The task counts as the process: its completion fires the exit signal
    /// and killing the handle aborts it.
    pub fn from_task<R, W>(label: impl Into<String>, reader: R, writer: W, task: JoinHandle<()>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::supervised(
            label.into(),
            None,
            Kind::Task,
            Box::new(reader),
            Box::new(writer),
            Backing::Task(task),
        )
    }

    fn supervised(
        label: String,
        pid: Option<u32>,
        kind: Kind,
        reader: BoxReader,
        writer: BoxWriter,
        backing: Backing,
    ) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        tokio::spawn(supervise(label.clone(), backing, kill.clone(), exit_tx));

        Self {
            label,
            pid,
            kind,
            writer: Mutex::new(Some(writer)),
            reader: std::sync::Mutex::new(Some(reader)),
            exit: exit_rx,
            kill,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes raw bytes to the server. Writes are delivered in call order.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "server input already closed",
            ));
        };
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Closes the server's input; well-behaved servers exit on EOF.
    pub async fn close_input(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Failed to close input of {}: {}", self.label, e);
            }
        }
    }

    /// Takes the inbound byte stream. Only the first call returns it.
    pub fn inbound(&mut self) -> Option<Inbound> {
        self.reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ReaderStream::new)
    }

    /// Receiver that turns `Some` once the server has exited
    pub fn exit_signal(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Waits for the server to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let observed = match exit.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        observed.unwrap_or(ProcessExit::Killed)
    }

    /// Forcibly ends the server without waiting.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Asks the server to exit, escalating to a kill after `grace`.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.try_exit() {
            return exit;
        }

        self.close_input().await;
        match self.kind {
            Kind::Process => self.signal_terminate(),
            Kind::Socket => self.kill(),
            Kind::Task => {}
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing it",
                    self.label, grace
                );
                self.kill();
                self.wait().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!("Failed to send SIGTERM to {}: {}", self.label, e);
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {}
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exit", &self.try_exit())
            .finish()
    }
}

fn check_working_directory(path: &Path) -> Result<(), SpawnError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(SpawnError::WorkingDirectory {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(SpawnError::WorkingDirectory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

async fn supervise(
    label: String,
    backing: Backing,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let exit = match backing {
        Backing::Child(mut child) => {
            tokio::select! {
                status = child.wait() => exit_from_status(status),
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!("Failed to kill {}: {}", label, e);
                    }
                    exit_from_status(child.wait().await)
                }
            }
        }
        Backing::Task(mut task) => {
            tokio::select! {
                result = &mut task => exit_from_join(result),
                _ = kill.cancelled() => {
                    task.abort();
                    let _ = (&mut task).await;
                    ProcessExit::Killed
                }
            }
        }
        Backing::Socket => {
            kill.cancelled().await;
            ProcessExit::Disconnected
        }
    };

    debug!("{} {}", label, exit);
    exit_tx.send_replace(Some(exit));
}

fn exit_from_status(status: io::Result<ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ProcessExit::Exited(code),
            None => signal_of(&status).map_or(ProcessExit::Killed, ProcessExit::Signaled),
        },
        Err(e) => {
            warn!("Failed to wait for language server process: {}", e);
            ProcessExit::Killed
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

fn exit_from_join(result: Result<(), JoinError>) -> ProcessExit {
    match result {
        Ok(()) => ProcessExit::Exited(0),
        Err(e) if e.is_cancelled() => ProcessExit::Killed,
        Err(e) => {
            warn!("In-process language server panicked: {}", e);
            ProcessExit::Exited(101)
        }
    }
}

async fn log_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[{}] {}", label, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading stderr of {}: {}", label, e);
                break;
            }
        }
    }
}
