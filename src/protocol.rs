//! Session socket messages.
//!
//! Frames are JSON text: `{"type": "<kebab-name>", "data": {...}}` with
//! camelCase fields. Unit messages carry no `data`.

use serde::{Deserialize, Serialize};

use crate::container::PtySize;
use crate::shadow::{ChangeSummary, DiffData};

/// Sent as an `output` frame before history replay.
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[3J\x1b[H";

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Attach {
        container_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    CommitChanges {
        container_id: String,
        commit_message: String,
    },
    PushChanges {
        container_id: String,
        #[serde(default)]
        branch_name: Option<String>,
    },
}

impl ClientMessage {
    /// Requested terminal size of an `attach`, when both dimensions are given.
    pub fn attach_size(cols: Option<u16>, rows: Option<u16>) -> Option<PtySize> {
        match (cols, rows) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some(PtySize { cols, rows }),
            _ => None,
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Attached {
        container_id: String,
    },
    Output {
        data: String,
    },
    SyncComplete {
        container_id: String,
        has_changes: bool,
        summary: ChangeSummary,
        diff_data: DiffData,
    },
    SyncError {
        container_id: String,
        message: String,
    },
    CommitSuccess {
        container_id: String,
        commit: String,
    },
    CommitError {
        message: String,
    },
    PushSuccess {
        container_id: String,
        branch: String,
    },
    PushError {
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    ContainerDisconnected,
}

impl ServerMessage {
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    pub fn clear_screen() -> Self {
        Self::output(CLEAR_SCREEN)
    }
}
