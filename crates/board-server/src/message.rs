//! Handshake messages and frame classification.
//!
//! Every WebSocket frame is UTF-8 JSON. Control frames carry a `type` field
//! (`handshake`, `handshake-rejected`); board messages carry `event`/`data`.

use board_sync::{BoardMessage, ProtocolError};
use serde::{Deserialize, Serialize};

/// Maximum message size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

pub const HANDSHAKE_TYPE: &str = "handshake";
pub const REJECTED_TYPE: &str = "handshake-rejected";

/// Handshake message exchanged when a session connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The sender's unique identifier
    #[serde(rename = "peerId")]
    pub peer_id: String,

    /// Role in the connection: "server" or "client"
    pub role: String,

    /// Bearer token presented by clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl HandshakeMessage {
    pub fn server(peer_id: &str) -> Self {
        Self {
            msg_type: HANDSHAKE_TYPE.to_string(),
            peer_id: peer_id.to_string(),
            role: "server".to_string(),
            token: None,
        }
    }

    pub fn client(peer_id: &str, token: Option<String>) -> Self {
        Self {
            msg_type: HANDSHAKE_TYPE.to_string(),
            peer_id: peer_id.to_string(),
            role: "client".to_string(),
            token,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Sent by the hub right before closing a session whose token it refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRejected {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub reason: String,
}

impl HandshakeRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            msg_type: REJECTED_TYPE.to_string(),
            reason: reason.into(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake(HandshakeMessage),
    Rejected(HandshakeRejected),
    Board(BoardMessage),
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

impl Frame {
    /// Classify and decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let tag = serde_json::from_str::<Tagged>(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        let decode_err = |e: serde_json::Error| ProtocolError::Deserialization(e.to_string());
        match tag.msg_type.as_deref() {
            Some(HANDSHAKE_TYPE) => serde_json::from_str(text)
                .map(Frame::Handshake)
                .map_err(decode_err),
            Some(REJECTED_TYPE) => serde_json::from_str(text)
                .map(Frame::Rejected)
                .map_err(decode_err),
            _ => BoardMessage::decode(text).map(Frame::Board),
        }
    }
}
