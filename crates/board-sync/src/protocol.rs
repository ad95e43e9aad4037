//! Wire protocol between board clients and the board hub.
//!
//! Every message is a JSON text frame of the form
//! `{ "event": "<kebab-case name>", "data": { ... } }`.
//! Paths are relative to the hub's storage root and start with the board name
//! (`demo/notes.md`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BoardSnapshot, FileKind};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Messages exchanged over a board session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BoardMessage {
    /// Client joins a board; the hub replies with its stored snapshot.
    #[serde(rename_all = "camelCase")]
    JoinBoard { board_name: String },

    /// Client asks for an empty file to exist at `path`.
    CreateFile { path: String },

    /// Client writes file contents.
    UpdateFile { path: String, content: String },

    /// Client persists the whole board. Acknowledged with `StateSaved`.
    #[serde(rename_all = "camelCase")]
    UpdateState {
        board_name: String,
        board: BoardSnapshot,
        request_id: String,
    },

    /// Client asks for a frame's directory.
    #[serde(rename_all = "camelCase")]
    CreateDirectory { element_id: String, name: String },

    /// Frame renamed. Sent by clients as a request and relayed by the hub.
    #[serde(rename_all = "camelCase")]
    FolderRenamed {
        element_id: String,
        old_name: String,
        new_name: String,
    },

    /// Hub acknowledgement of `UpdateState`.
    #[serde(rename_all = "camelCase")]
    StateSaved {
        board_name: String,
        request_id: String,
    },

    /// Whole-board snapshot from the hub.
    #[serde(rename_all = "camelCase")]
    BoardUpdate {
        board_name: String,
        board: BoardSnapshot,
    },

    FileChanged { path: String, content: String },

    FileAdded {
        path: String,
        #[serde(rename = "type")]
        kind: FileKind,
    },

    FileDeleted { path: String },

    #[serde(rename_all = "camelCase")]
    FolderCreated { element_id: String, name: String },
}

impl BoardMessage {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinBoard { .. } => "join-board",
            Self::CreateFile { .. } => "create-file",
            Self::UpdateFile { .. } => "update-file",
            Self::UpdateState { .. } => "update-state",
            Self::CreateDirectory { .. } => "create-directory",
            Self::FolderRenamed { .. } => "folder-renamed",
            Self::StateSaved { .. } => "state-saved",
            Self::BoardUpdate { .. } => "board-update",
            Self::FileChanged { .. } => "file-changed",
            Self::FileAdded { .. } => "file-added",
            Self::FileDeleted { .. } => "file-deleted",
            Self::FolderCreated { .. } => "folder-created",
        }
    }
}
