//! Transport trait for the persistent connection to the board hub.
//!
//! Implementations:
//! - `MemoryTransport` - For testing, records outbound messages
//! - `RemoteTransport` (in board-server) - WebSocket client with reconnection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::events::{Emitter, Subscription};
use crate::protocol::BoardMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by either side or lost.
    Closed,
    /// Hub rejected our credential. The transport is unavailable, not failing.
    Unauthorized,
    Error(String),
}

/// Connection lifecycle and inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Message(BoardMessage),
}

/// A persistent, bidirectional, named-message connection.
pub trait Transport: Send + Sync {
    /// Queue a message for the hub. Fails when the connection is down.
    fn emit(&self, message: BoardMessage) -> Result<()>;

    /// Receive lifecycle events and inbound messages.
    fn subscribe(&self, callback: Box<dyn Fn(&TransportEvent) + Send + Sync>) -> Subscription;

    fn is_connected(&self) -> bool;
}

/// Loopback transport that records what was emitted and lets tests inject
/// inbound traffic.
pub struct MemoryTransport {
    events: Arc<Emitter<TransportEvent>>,
    sent: Mutex<Vec<BoardMessage>>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            events: Arc::new(Emitter::new()),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        }
    }
}

impl MemoryTransport {
    /// Create a transport that starts out connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages emitted so far.
    pub fn sent(&self) -> Vec<BoardMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain the emitted messages.
    pub fn take_sent(&self) -> Vec<BoardMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Deliver an inbound message to subscribers.
    pub fn deliver(&self, message: BoardMessage) {
        self.events.emit(&TransportEvent::Message(message));
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit(&TransportEvent::Connected);
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(&TransportEvent::Disconnected { reason });
    }

    /// Make `emit` fail while connected, to simulate a broken pipe.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, message: BoardMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed(format!(
                "simulated failure sending {}",
                message.name()
            )));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }

    fn subscribe(&self, callback: Box<dyn Fn(&TransportEvent) + Send + Sync>) -> Subscription {
        self.events.subscribe(callback)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_fails_while_disconnected() {
        let transport = MemoryTransport::new();
        transport.disconnect(DisconnectReason::Closed);

        let result = transport.emit(BoardMessage::CreateFile {
            path: "demo/a.md".into(),
        });

        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_subscribers_see_lifecycle_and_messages() {
        let transport = MemoryTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _sub = transport.subscribe(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        transport.disconnect(DisconnectReason::Unauthorized);
        transport.connect();
        transport.deliver(BoardMessage::FileDeleted {
            path: "demo/a.md".into(),
        });

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
