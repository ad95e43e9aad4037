//! WebSocket server for accepting client sessions.
//!
//! Manages connection lifecycle, token checks and per-board rooms.
//! The handshake lifecycle is encapsulated: callers only see `ServerEvent`s
//! for sessions that presented an accepted token, via `poll_event()`.

use crate::connection::{ConnectionEvent, SessionConnection};
use anyhow::{anyhow, Result};
use board_sync::BoardMessage;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Event emitted by the server after the handshake lifecycle is resolved.
#[derive(Debug)]
pub enum ServerEvent {
    /// A session completed the handshake.
    SessionOpened { conn_id: String, peer_id: String },
    /// A board message from an authorized session.
    Message {
        conn_id: String,
        message: BoardMessage,
    },
    /// A previously opened session disconnected.
    SessionClosed {
        conn_id: String,
        board: Option<String>,
    },
}

struct Session {
    conn: SessionConnection,
    peer_id: String,
    board: Option<String>,
}

/// WebSocket server managing client sessions.
pub struct WebSocketServer {
    /// Our peer ID
    peer_id: String,
    /// Accepted bearer tokens. Empty means no authentication.
    tokens: HashSet<String>,
    /// Pre-handshake connections indexed by conn_id
    pending: HashMap<String, SessionConnection>,
    /// Post-handshake sessions indexed by conn_id
    sessions: HashMap<String, Session>,
    /// Counter for generating connection IDs
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl WebSocketServer {
    pub fn new(peer_id: String, tokens: impl IntoIterator<Item = String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            peer_id,
            tokens: tokens.into_iter().collect(),
            pending: HashMap::new(),
            sessions: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection.
    ///
    /// Upgrades to WebSocket and sends our handshake. The connection stays
    /// pending until the client answers with its own.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without finishing the upgrade.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = SessionConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        if let Err(e) = conn.send_handshake(&self.peer_id).await {
            error!("Failed to send handshake to {}: {}", conn_id, e);
            return;
        }

        self.pending.insert(conn_id, conn);
    }

    fn authorize(&self, token: Option<&str>) -> bool {
        self.tokens.is_empty() || token.is_some_and(|t| self.tokens.contains(t))
    }

    /// Wait for the next server event, encapsulating the handshake lifecycle.
    ///
    /// Connections that close before the handshake, or whose token is
    /// refused, are cleaned up without an event.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.event_rx.recv().await? {
                ConnectionEvent::Handshake { conn_id, handshake } => {
                    let Some(mut conn) = self.pending.remove(&conn_id) else {
                        debug!("Repeated handshake from {}, ignoring", conn_id);
                        continue;
                    };

                    if !self.authorize(handshake.token.as_deref()) {
                        warn!(
                            "Rejecting {} ({}): missing or invalid token",
                            conn_id, handshake.peer_id
                        );
                        if let Err(e) = conn.send_rejection("invalid token").await {
                            debug!("Failed to send rejection to {}: {}", conn_id, e);
                        }
                        conn.close().await;
                        continue;
                    }

                    debug!("Handshake complete: {} is {}", conn_id, handshake.peer_id);
                    self.sessions.insert(
                        conn_id.clone(),
                        Session {
                            conn,
                            peer_id: handshake.peer_id.clone(),
                            board: None,
                        },
                    );
                    return Some(ServerEvent::SessionOpened {
                        conn_id,
                        peer_id: handshake.peer_id,
                    });
                }
                ConnectionEvent::Message { conn_id, message } => {
                    if !self.sessions.contains_key(&conn_id) {
                        warn!(
                            "Dropping {} from {} before handshake",
                            message.name(),
                            conn_id
                        );
                        continue;
                    }
                    return Some(ServerEvent::Message { conn_id, message });
                }
                ConnectionEvent::Closed { conn_id } => {
                    if let Some(session) = self.sessions.remove(&conn_id) {
                        info!("Session {} ({}) disconnected", conn_id, session.peer_id);
                        return Some(ServerEvent::SessionClosed {
                            conn_id,
                            board: session.board,
                        });
                    }
                    self.pending.remove(&conn_id);
                    debug!("Connection closed before handshake: {}", conn_id);
                }
            }
        }
    }

    /// Put a session in a board's room.
    pub fn join(&mut self, conn_id: &str, board: &str) {
        if let Some(session) = self.sessions.get_mut(conn_id) {
            session.board = Some(board.to_string());
        }
    }

    /// The board a session joined.
    pub fn board_of(&self, conn_id: &str) -> Option<&str> {
        self.sessions.get(conn_id)?.board.as_deref()
    }

    /// Send a message to one session.
    pub async fn send(&self, conn_id: &str, message: &BoardMessage) -> Result<()> {
        let session = self
            .sessions
            .get(conn_id)
            .ok_or_else(|| anyhow!("Unknown session: {}", conn_id))?;
        session.conn.send(message).await
    }

    /// Send a message to every session on `board`.
    pub async fn broadcast_board(&self, board: &str, message: &BoardMessage) {
        self.broadcast_filtered(board, None, message).await;
    }

    /// Send a message to every session on `board` except `exclude`.
    pub async fn broadcast_board_except(&self, board: &str, exclude: &str, message: &BoardMessage) {
        self.broadcast_filtered(board, Some(exclude), message).await;
    }

    async fn broadcast_filtered(&self, board: &str, exclude: Option<&str>, message: &BoardMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {}: {}", message.name(), e);
                return;
            }
        };

        for (conn_id, session) in &self.sessions {
            if session.board.as_deref() != Some(board) || Some(conn_id.as_str()) == exclude {
                continue;
            }
            if let Err(e) = session.conn.send_text(text.clone()).await {
                warn!("Failed to relay to {}: {}", conn_id, e);
            }
        }
    }

    /// Number of sessions that completed the handshake.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions in a board's room.
    pub fn board_session_count(&self, board: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.board.as_deref() == Some(board))
            .count()
    }
}
