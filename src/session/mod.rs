//! Session layer: per-tab state machines and the process-wide registry

pub mod registry;
pub mod session;
pub mod types;

pub use registry::SessionRegistry;
pub use session::{CoreDeps, SshSession};
pub use types::{CloseReason, SessionKind, SessionState, StateCell};
