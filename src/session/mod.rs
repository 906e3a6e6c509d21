//! Session layer
//! - transport.rs: request/response correlation over a ProcessHandle
//! - lifecycle.rs: one server lifetime (Starting .. Stopped)
//! - manager.rs: current session, serialized restarts, caller-facing API
//! - types.rs: ids, states, capabilities, events, settings
//! - error.rs: TransportError, SessionError, RequestError

pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod transport;
pub mod types;

pub use error::{RequestError, SessionError, TransportError};
pub use lifecycle::Session;
pub use manager::SessionManager;
pub use transport::TransportSession;
pub use types::{Capabilities, ServerEvent, SessionId, SessionSettings, SessionState, SessionStatus};
