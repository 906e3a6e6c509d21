//! Trigger layer
//! - router.rs: TriggerRouter (debounce, start/restart dispatch), its live RouterSettings and the SessionControl seam
//! - selector.rs: DocumentSelector for document-open triggers

pub mod router;
pub mod selector;

pub use router::{RouterSettings, SessionControl, TriggerRouter};
pub use selector::{DocumentFilter, DocumentSelector};

/// External change events the router reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Dotted settings keys that changed (`server.args`, `client`)
    ConfigChanged { keys: Vec<String> },
    /// Interpreter or environment changed under the server
    EnvironmentChanged,
    DocumentOpened { uri: String, language_id: String },
    UserRestart,
}
