//! Typed error hierarchy for shadowbox.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `ShadowError`: shadow repository population and git plumbing
//! - `SessionError`: terminal session attach/input failures
//! - `GitWorkflowError`: user-triggered commit and push failures
//!
//! Transport, ownership-fix and watcher failures never show up here: they are
//! recovered locally through fallbacks and only logged.

use thiserror::Error;

use crate::fallback::ExhaustedError;

/// Errors from the shadow repository.
#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("Failed to initialize shadow repository: {0}")]
    Initialization(#[source] ExhaustedError),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout {
        command: String,
        timeout: std::time::Duration,
    },

    #[error("Shadow repository is not initialized")]
    NotReady,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the terminal session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Container {container_id} not found")]
    ContainerNotFound { container_id: String },

    #[error("Client is not attached to a container")]
    NotAttached,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    /// Protocol code reported alongside the message, if any.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            SessionError::ContainerNotFound { .. } => Some("CONTAINER_NOT_FOUND"),
            _ => None,
        }
    }
}

/// Errors from commit and push requests. Reported to the requesting client only.
#[derive(Debug, Error)]
pub enum GitWorkflowError {
    #[error("No active session for container {container_id}")]
    NoSession { container_id: String },

    #[error("No remote repository configured; cannot push")]
    NoRemote,

    #[error("No changes to commit")]
    NothingToCommit,

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Push failed: {0}")]
    PushFailed(String),

    #[error(transparent)]
    Shadow(#[from] ShadowError),
}
