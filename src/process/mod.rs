//! Process layer
//! - handle.rs: ProcessHandle (child process, socket, or in-process task)
//! - launcher.rs: Launcher trait and the OS-backed SystemLauncher
//! - error.rs: SpawnError

pub mod error;
pub mod handle;
pub mod launcher;

pub use error::SpawnError;
pub use handle::{Inbound, ProcessExit, ProcessHandle, SpawnSpec};
pub use launcher::{Endpoint, Launcher, SystemLauncher};
