//! Change detection and shadow repository syncing.

pub mod monitor;
pub mod orchestrator;

pub use monitor::{MonitorHandle, MonitorMode};
pub use orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome, SyncReport};
