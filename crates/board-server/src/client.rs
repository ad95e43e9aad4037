//! WebSocket client transport for running sync sessions natively.
//!
//! `RemoteTransport` implements `board_sync::Transport` over a connection to
//! the hub, including:
//! - Handshake with an optional bearer token
//! - Automatic reconnection with exponential backoff
//! - A `drive` loop that delivers inbound events and ticks the session on the
//!   same task, so the sync core never sees concurrent callbacks

use crate::message::{Frame, HandshakeMessage};
use board_sync::events::Emitter;
use board_sync::transport::Result as TransportResult;
use board_sync::{
    BoardMessage, DisconnectReason, Subscription, SyncSession, Transport, TransportError,
    TransportEvent,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_ms = config.initial_delay_ms as f64
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_millis(delay_ms.min(config.max_delay_ms as f64) as u64)
}

/// Attempt counter across reconnects.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempts: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an attempt and return how long to wait before it, or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        if config.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        self.attempts += 1;
        Some(calculate_backoff(self.attempts, config))
    }

    /// Reset state after a successful handshake.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `ws://` or `wss://` URL of the hub
    pub url: String,
    pub peer_id: String,
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
}

/// How one connection ended.
enum Ended {
    Closed(DisconnectReason),
    Rejected(String),
}

/// Transport to a remote hub.
pub struct RemoteTransport {
    events: Arc<Emitter<TransportEvent>>,
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    inbound: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl RemoteTransport {
    /// Start connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(options: ClientOptions) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(Self::run(
            options,
            outbound_rx,
            inbound_tx,
            Arc::clone(&connected),
        ));

        Arc::new(Self {
            events: Arc::new(Emitter::new()),
            outbound,
            connected,
            inbound: Mutex::new(inbound),
            task: StdMutex::new(Some(task)),
        })
    }

    /// Deliver inbound events and tick `session` every `period` until the
    /// connection task gives up.
    pub async fn drive(&self, session: &SyncSession, period: Duration) {
        let mut inbound = self.inbound.lock().await;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.events.emit(&event),
                    None => {
                        info!("Connection task finished");
                        break;
                    }
                },
                _ = ticker.tick() => session.tick(),
            }
        }
    }

    /// Stop the connection task.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    async fn run(
        options: ClientOptions,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        inbound_tx: mpsc::UnboundedSender<TransportEvent>,
        connected: Arc<AtomicBool>,
    ) {
        let mut state = ReconnectState::new();
        loop {
            let ended =
                Self::run_connection(&options, &mut outbound_rx, &inbound_tx, &connected, &mut state)
                    .await;
            let was_connected = connected.swap(false, Ordering::SeqCst);

            match ended {
                Ended::Rejected(reason) => {
                    warn!("Hub {} rejected our token: {}", options.url, reason);
                    let _ = inbound_tx.send(TransportEvent::Disconnected {
                        reason: DisconnectReason::Unauthorized,
                    });
                    return;
                }
                Ended::Closed(reason) => {
                    if was_connected {
                        let _ = inbound_tx.send(TransportEvent::Disconnected { reason });
                    } else {
                        debug!("Connection attempt to {} failed: {:?}", options.url, reason);
                    }
                }
            }

            // Messages queued for the old connection are stale.
            while outbound_rx.try_recv().is_ok() {}

            let Some(delay) = state.next_delay(&options.reconnect) else {
                warn!(
                    "Giving up on {} after {} attempts",
                    options.url, state.attempts
                );
                return;
            };
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                options.url, delay, state.attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_connection(
        options: &ClientOptions,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        inbound_tx: &mpsc::UnboundedSender<TransportEvent>,
        connected: &AtomicBool,
        state: &mut ReconnectState,
    ) -> Ended {
        let (ws_stream, _) = match connect_async(options.url.as_str()).await {
            Ok(connection) => connection,
            Err(e) => return Ended::Closed(DisconnectReason::Error(e.to_string())),
        };
        let (mut write, mut read) = ws_stream.split();

        let handshake = HandshakeMessage::client(&options.peer_id, options.token.clone());
        let sent = match handshake.to_text() {
            Ok(text) => write.send(Message::text(text)).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            return Ended::Closed(DisconnectReason::Error(e));
        }

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                        Ok(Frame::Handshake(handshake)) => {
                            debug!("Connected to hub {} ({})", options.url, handshake.peer_id);
                            state.reset();
                            connected.store(true, Ordering::SeqCst);
                            let _ = inbound_tx.send(TransportEvent::Connected);
                        }
                        Ok(Frame::Rejected(rejected)) => return Ended::Rejected(rejected.reason),
                        Ok(Frame::Board(message)) => {
                            let _ = inbound_tx.send(TransportEvent::Message(message));
                        }
                        Err(e) => warn!("Malformed frame from hub: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Ended::Closed(DisconnectReason::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Closed(DisconnectReason::Error(e.to_string())),
                },
                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::text(text)).await {
                        return Ended::Closed(DisconnectReason::Error(e.to_string()));
                    }
                }
            }
        }
    }
}

impl Transport for RemoteTransport {
    fn emit(&self, message: BoardMessage) -> TransportResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let text = message.encode()?;
        self.outbound
            .send(text)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn subscribe(&self, callback: Box<dyn Fn(&TransportEvent) + Send + Sync>) -> Subscription {
        self.events.subscribe(callback)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 1s, 2s, 4s, ... capped at 30s
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(16));
        assert_eq!(calculate_backoff(6, &config), Duration::from_secs(30));
        assert_eq!(calculate_backoff(20, &config), Duration::from_secs(30));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_factor: 3.0,
            max_attempts: None,
        };

        // 1s, 3s, 9s, 10s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_reconnect_state_counts_and_resets() {
        let mut state = ReconnectState::new();
        let config = ReconnectConfig::default();

        assert_eq!(state.next_delay(&config), Some(Duration::from_secs(1)));
        assert_eq!(state.next_delay(&config), Some(Duration::from_secs(2)));
        assert_eq!(state.attempts, 2);

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.next_delay(&config), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_reconnect_state_respects_max_attempts() {
        let mut state = ReconnectState::new();
        let config = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };

        assert!(state.next_delay(&config).is_some());
        assert!(state.next_delay(&config).is_some());
        assert_eq!(state.next_delay(&config), None);
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_fails() {
        let transport = RemoteTransport::connect(ClientOptions {
            url: "ws://127.0.0.1:1".into(),
            peer_id: "test".into(),
            token: None,
            reconnect: ReconnectConfig {
                max_attempts: Some(0),
                ..ReconnectConfig::default()
            },
        });

        assert!(!transport.is_connected());
        assert!(matches!(
            transport.emit(BoardMessage::JoinBoard {
                board_name: "demo".into()
            }),
            Err(TransportError::NotConnected)
        ));
        transport.close();
    }
}
