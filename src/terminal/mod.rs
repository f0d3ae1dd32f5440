//! Shared terminal sessions.

pub mod history;
pub mod registry;

pub use history::{OutputHistory, Utf8Carry};
pub use registry::{ClientId, ClientSender, SessionEvent, SessionInfo, SessionRegistry, SessionState};
