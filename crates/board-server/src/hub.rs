//! The board hub: routes client messages through the store and relays the
//! results to the sessions of each board.

use std::future::Future;

use anyhow::Result;
use board_sync::BoardMessage;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::fs::FileSystem;
use crate::hash::board_of;
use crate::server::{ServerEvent, WebSocketServer};
use crate::store::{Audience, BoardStore, Outbound, StoreError};
use crate::watcher::{FileEvent, FileWatcher};

pub struct Hub<F> {
    server: WebSocketServer,
    store: BoardStore<F>,
}

impl<F: FileSystem> Hub<F> {
    pub fn new(server: WebSocketServer, store: BoardStore<F>) -> Self {
        Self { server, store }
    }

    pub fn store(&self) -> &BoardStore<F> {
        &self.store
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut watcher: Option<FileWatcher>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = self.server.poll_event() => {
                    self.on_server_event(event).await;
                }

                Some(event) = next_file_event(&mut watcher) => {
                    self.on_file_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Hub stopped with {} session(s) open", self.server.session_count());
        Ok(())
    }

    pub async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionOpened { conn_id, peer_id } => {
                info!("Session {} opened by {}", conn_id, peer_id);
            }
            ServerEvent::Message { conn_id, message } => {
                self.on_message(&conn_id, message).await;
            }
            ServerEvent::SessionClosed { conn_id, board } => {
                if let Some(board) = board {
                    debug!(
                        "{} left {}, {} session(s) remain",
                        conn_id,
                        board,
                        self.server.board_session_count(&board)
                    );
                }
            }
        }
    }

    async fn on_message(&mut self, conn_id: &str, message: BoardMessage) {
        let name = message.name();
        let joining = match &message {
            BoardMessage::JoinBoard { board_name } => Some(board_name.clone()),
            _ => None,
        };
        let joined = self.server.board_of(conn_id).map(str::to_string);

        let outbound = match self.store.apply(joined.as_deref(), message).await {
            Ok(outbound) => outbound,
            Err(e @ (StoreError::Fs(_) | StoreError::Encode(_) | StoreError::CorruptSnapshot { .. })) => {
                error!("Failed to apply {} from {}: {}", name, conn_id, e);
                return;
            }
            Err(e) => {
                warn!("Rejected {} from {}: {}", name, conn_id, e);
                return;
            }
        };

        let board = match joining {
            Some(board) => {
                self.server.join(conn_id, &board);
                info!("{} joined board {}", conn_id, board);
                board
            }
            None => match joined {
                Some(board) => board,
                None => return,
            },
        };
        self.route(conn_id, &board, outbound).await;
    }

    async fn route(&self, conn_id: &str, board: &str, outbound: Vec<Outbound>) {
        for Outbound { audience, message } in outbound {
            match audience {
                Audience::Sender => {
                    if let Err(e) = self.server.send(conn_id, &message).await {
                        warn!("Failed to reply {} to {}: {}", message.name(), conn_id, e);
                    }
                }
                Audience::Others => {
                    self.server
                        .broadcast_board_except(board, conn_id, &message)
                        .await;
                }
                Audience::Board => self.server.broadcast_board(board, &message).await,
            }
        }
    }

    pub async fn on_file_event(&mut self, event: FileEvent) {
        match self.store.external_change(&event.path).await {
            Ok(Some(message)) => {
                let board = board_of(&event.path);
                info!(
                    "External change to {}, notifying {} session(s)",
                    event.path,
                    self.server.board_session_count(board)
                );
                self.server.broadcast_board(board, &message).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to process change to {}: {}", event.path, e);
            }
        }
    }
}

async fn next_file_event(watcher: &mut Option<FileWatcher>) -> Option<FileEvent> {
    match watcher {
        Some(watcher) => watcher.event_rx().recv().await,
        None => std::future::pending().await,
    }
}
