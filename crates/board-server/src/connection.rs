//! Individual session connection management.
//!
//! Each connection wraps a WebSocket stream, handling the split
//! between read and write halves for async operation.

use crate::message::{Frame, HandshakeMessage, HandshakeRejected, MAX_MESSAGE_SIZE};
use anyhow::{anyhow, Result};
use board_sync::BoardMessage;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The client introduced itself
    Handshake {
        conn_id: String,
        handshake: HandshakeMessage,
    },
    /// A board message from the client
    Message {
        conn_id: String,
        message: BoardMessage,
    },
    /// Connection was closed
    Closed { conn_id: String },
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single WebSocket connection to a client session.
pub struct SessionConnection {
    /// Connection ID assigned by the server (e.g., "conn-1")
    pub conn_id: String,
    /// Write half of the WebSocket (wrapped for sharing across tasks)
    write: Arc<Mutex<WsSink>>,
    /// Handle to the read task
    read_task: Option<JoinHandle<()>>,
}

impl SessionConnection {
    /// Create a connection from a WebSocket stream.
    ///
    /// Spawns a read task that forwards frames to the event channel.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        warn!("Non UTF-8 frame from {}, dropping", conn_id);
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            };

            if text.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Message from {} exceeds max size ({} > {}), dropping",
                    conn_id,
                    text.len(),
                    MAX_MESSAGE_SIZE
                );
                continue;
            }

            let event = match Frame::parse(&text) {
                Ok(Frame::Handshake(handshake)) => ConnectionEvent::Handshake {
                    conn_id: conn_id.clone(),
                    handshake,
                },
                Ok(Frame::Board(message)) => ConnectionEvent::Message {
                    conn_id: conn_id.clone(),
                    message,
                },
                Ok(Frame::Rejected(_)) => {
                    warn!("Client {} sent a handshake rejection, ignoring", conn_id);
                    continue;
                }
                Err(e) => {
                    warn!("Malformed frame from {}: {}", conn_id, e);
                    continue;
                }
            };
            if event_tx.send(event).is_err() {
                return;
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::text(text))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    pub async fn send(&self, message: &BoardMessage) -> Result<()> {
        self.send_text(message.encode()?).await
    }

    /// Send our handshake to the client.
    pub async fn send_handshake(&self, peer_id: &str) -> Result<()> {
        self.send_text(HandshakeMessage::server(peer_id).to_text()?)
            .await
    }

    /// Tell the client its credential was refused.
    pub async fn send_rejection(&self, reason: &str) -> Result<()> {
        self.send_text(HandshakeRejected::new(reason).to_text()?)
            .await
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
