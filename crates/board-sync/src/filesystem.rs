//! Filesystem adapter: bridges the board model and the remote board store.
//!
//! Outbound, it turns element changes into hub requests and pushes debounced
//! whole-board snapshots. Inbound, it turns hub messages into
//! `FileSystemEvent`s. A snapshot write holds an `AckGuard` until the hub
//! answers `state-saved` with the same request id; `board-update` messages
//! arriving meanwhile are our own echo and are dropped. Structural requests
//! made while the hub is unreachable are queued and replayed after the next
//! join.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::SharedClock;
use crate::debounce::Debouncer;
use crate::error::{AdapterError, Result};
use crate::events::{Emitter, Subscription};
use crate::guard::AckGuard;
use crate::model::{board_file_path, BoardSnapshot, Element, ElementKind, FileKind};
use crate::protocol::BoardMessage;
use crate::session::SessionConfig;
use crate::transport::{DisconnectReason, Transport, TransportError, TransportEvent};

/// Base for resolving relative links. Only the path of the result is used.
const LINK_BASE: &str = "http://board.invalid/";

/// Changes reported by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSystemEvent {
    FileCreated {
        path: String,
        kind: FileKind,
        timestamp: u64,
    },
    FileModified {
        path: String,
        content: String,
        timestamp: u64,
    },
    FileDeleted {
        path: String,
        timestamp: u64,
    },
    DirectoryCreated {
        path: String,
        element_id: String,
        timestamp: u64,
    },
    DirectoryDeleted {
        path: String,
        timestamp: u64,
    },
    DirectoryRenamed {
        old_path: String,
        new_path: String,
        element_id: String,
        timestamp: u64,
    },
    /// Whole-board state pushed by the hub.
    StateSync {
        snapshot: BoardSnapshot,
        timestamp: u64,
    },
}

struct FsState {
    connection: Option<Subscription>,
    pending_state: Debouncer<BoardSnapshot>,
    guard: AckGuard,
    /// Directory path -> frame element id.
    directories: HashMap<String, String>,
    /// Requests made while disconnected, oldest first.
    outbox: Vec<BoardMessage>,
}

pub struct FilesystemAdapter {
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    board_name: String,
    files_prefix: String,
    state: Mutex<FsState>,
    events: Arc<Emitter<FileSystemEvent>>,
    self_ref: Weak<FilesystemAdapter>,
}

impl FilesystemAdapter {
    pub fn new(clock: SharedClock, transport: Arc<dyn Transport>, config: &SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            clock,
            transport,
            board_name: config.board_name.clone(),
            files_prefix: config.files_prefix.clone(),
            state: Mutex::new(FsState {
                connection: None,
                pending_state: Debouncer::new(config.state_debounce_ms),
                guard: AckGuard::new(config.ack_timeout_ms),
                directories: HashMap::new(),
                outbox: Vec::new(),
            }),
            events: Arc::new(Emitter::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn board_name(&self) -> &str {
        &self.board_name
    }

    /// Listen to the transport and join the board.
    ///
    /// The hub answers with the stored snapshot, if there is one. Joining is
    /// repeated on every reconnect.
    pub fn initialize(&self) -> Result<()> {
        let needs_subscription = self.lock().connection.is_none();
        if needs_subscription {
            let adapter = self.self_ref.clone();
            let subscription = self.transport.subscribe(Box::new(move |event| {
                if let Some(adapter) = adapter.upgrade() {
                    adapter.on_transport_event(event);
                }
            }));
            self.lock().connection = Some(subscription);
        }
        self.join()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&FileSystemEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Ask the hub for the file an embeddable points at.
    pub fn create_file(&self, element: &Element) -> Result<()> {
        let ElementKind::Embeddable { link } = &element.kind else {
            warn!("create_file called with non-embeddable element {}", element.id);
            return Ok(());
        };
        let Some(path) = resolve_link(link, &self.files_prefix) else {
            warn!("Cannot resolve link '{}' of element {}", link, element.id);
            return Ok(());
        };
        debug!("Requesting file {}", path);
        self.send(BoardMessage::CreateFile { path })
    }

    /// Ask the hub for a frame's directory.
    pub fn create_directory(&self, element: &Element) -> Result<()> {
        if !element.is_frame() {
            warn!("create_directory called with non-frame element {}", element.id);
            return Ok(());
        }
        let name = element.display_name();
        self.lock()
            .directories
            .insert(self.directory_path(&name), element.id.clone());
        debug!("Requesting directory {} for frame {}", name, element.id);
        self.send(BoardMessage::CreateDirectory {
            element_id: element.id.clone(),
            name,
        })
    }

    /// Tell the hub a frame was renamed from `old_name`.
    pub fn rename_directory(&self, element: &Element, old_name: &str) -> Result<()> {
        if !element.is_frame() {
            warn!("rename_directory called with non-frame element {}", element.id);
            return Ok(());
        }
        let new_name = element.display_name();
        if new_name == old_name {
            return Ok(());
        }
        {
            let mut state = self.lock();
            state.directories.remove(&self.directory_path(old_name));
            state
                .directories
                .insert(self.directory_path(&new_name), element.id.clone());
        }
        debug!("Renaming directory {} -> {}", old_name, new_name);
        self.send(BoardMessage::FolderRenamed {
            element_id: element.id.clone(),
            old_name: old_name.to_string(),
            new_name,
        })
    }

    pub fn remove_file(&self, element: &Element) -> Result<()> {
        warn!("Removing files is not supported (element {})", element.id);
        Err(AdapterError::Unsupported("remove file"))
    }

    pub fn remove_directory(&self, element: &Element) -> Result<()> {
        warn!("Removing directories is not supported (element {})", element.id);
        Err(AdapterError::Unsupported("remove directory"))
    }

    /// Queue a whole-board snapshot. Sent once no newer one arrives for the
    /// debounce window and no previous write is waiting for acknowledgement.
    pub fn update_board_state(&self, snapshot: BoardSnapshot) {
        let now = self.clock.now_ms();
        self.lock().pending_state.push(snapshot, now);
    }

    /// Send the queued snapshot now, if any.
    pub fn flush_board_state(&self) -> Result<()> {
        let pending = self.lock().pending_state.flush();
        match pending {
            Some(snapshot) => self.write_state(snapshot),
            None => Ok(()),
        }
    }

    /// Send `snapshot` now. Supersedes anything queued.
    pub fn persist_board_state(&self, snapshot: BoardSnapshot) -> Result<()> {
        self.lock().pending_state.clear();
        self.write_state(snapshot)
    }

    /// Whether a snapshot write is waiting for its acknowledgement.
    pub fn is_guarded(&self) -> bool {
        let now = self.clock.now_ms();
        self.lock().guard.is_held(now)
    }

    pub fn has_pending_state(&self) -> bool {
        self.lock().pending_state.is_pending()
    }

    /// Number of requests waiting for the connection to come back.
    pub fn queued_requests(&self) -> usize {
        self.lock().outbox.len()
    }

    /// Element id registered for a directory path, if known.
    pub fn directory_owner(&self, path: &str) -> Option<String> {
        self.lock().directories.get(path).cloned()
    }

    /// Send the queued snapshot once its window has passed.
    pub fn tick(&self, now: u64) {
        if !self.transport.is_connected() {
            return;
        }
        let due = {
            let mut state = self.lock();
            if state.guard.is_held(now) {
                return;
            }
            state.pending_state.take_due(now)
        };
        if let Some(snapshot) = due {
            if let Err(e) = self.write_state(snapshot) {
                error!("Failed to send board state: {}", e);
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.connection = None;
        state.pending_state.clear();
        state.guard.release();
        state.directories.clear();
        state.outbox.clear();
    }

    fn write_state(&self, snapshot: BoardSnapshot) -> Result<()> {
        let token = self.lock().guard.begin(self.clock.now_ms());
        let message = BoardMessage::UpdateState {
            board_name: self.board_name.clone(),
            board: snapshot,
            request_id: token.to_string(),
        };
        match self.transport.emit(message) {
            Ok(()) => {
                debug!("Board state sent, awaiting acknowledgement {}", token);
                Ok(())
            }
            Err(e) => {
                self.lock().guard.acknowledge(token.as_str());
                Err(e.into())
            }
        }
    }

    fn join(&self) -> Result<()> {
        match self.transport.emit(BoardMessage::JoinBoard {
            board_name: self.board_name.clone(),
        }) {
            Ok(()) => {
                info!("Joined board {}", self.board_name);
                Ok(())
            }
            Err(TransportError::NotConnected) => {
                debug!("Not connected yet, joining {} on connect", self.board_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, message: BoardMessage) -> Result<()> {
        match self.transport.emit(message.clone()) {
            Ok(()) => Ok(()),
            Err(TransportError::NotConnected) => {
                debug!("Not connected, queueing {} until reconnect", message.name());
                self.lock().outbox.push(message);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to reach board hub: {}", e);
                Err(e.into())
            }
        }
    }

    /// Send the requests queued while disconnected, in order.
    fn replay_queued(&self) {
        let queued = std::mem::take(&mut self.lock().outbox);
        if queued.is_empty() {
            return;
        }
        info!(
            "Replaying {} queued request(s) for board {}",
            queued.len(),
            self.board_name
        );

        let mut queued = queued.into_iter();
        while let Some(message) = queued.next() {
            if let Err(e) = self.transport.emit(message.clone()) {
                warn!("Failed to replay {}: {}", message.name(), e);
                let mut state = self.lock();
                let newer = std::mem::take(&mut state.outbox);
                state.outbox = std::iter::once(message).chain(queued).chain(newer).collect();
                return;
            }
        }
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => match self.join() {
                Ok(()) => self.replay_queued(),
                Err(e) => error!("Failed to rejoin board {}: {}", self.board_name, e),
            },
            TransportEvent::Disconnected { reason } => {
                // The acknowledgement for an in-flight write died with the connection.
                self.lock().guard.release();
                match reason {
                    DisconnectReason::Unauthorized => {
                        info!("Board hub rejected our credentials")
                    }
                    _ => debug!("Disconnected from board hub: {:?}", reason),
                }
            }
            TransportEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_message(&self, message: &BoardMessage) {
        let timestamp = self.clock.now_ms();
        let event = match message {
            BoardMessage::StateSaved {
                board_name,
                request_id,
            } if *board_name == self.board_name => {
                if !self.lock().guard.acknowledge(request_id) {
                    debug!("Ignoring stale acknowledgement {}", request_id);
                }
                return;
            }
            BoardMessage::BoardUpdate { board_name, board } if *board_name == self.board_name => {
                if self.lock().guard.is_held(timestamp) {
                    debug!("Dropping board update while our own write is in flight");
                    return;
                }
                FileSystemEvent::StateSync {
                    snapshot: board.clone(),
                    timestamp,
                }
            }
            BoardMessage::FileAdded { path, kind } if !self.is_board_file(path) => {
                FileSystemEvent::FileCreated {
                    path: path.clone(),
                    kind: *kind,
                    timestamp,
                }
            }
            BoardMessage::FileChanged { path, content } if !self.is_board_file(path) => {
                FileSystemEvent::FileModified {
                    path: path.clone(),
                    content: content.clone(),
                    timestamp,
                }
            }
            BoardMessage::FileDeleted { path } if !self.is_board_file(path) => {
                if self.lock().directories.remove(path).is_some() {
                    FileSystemEvent::DirectoryDeleted {
                        path: path.clone(),
                        timestamp,
                    }
                } else {
                    FileSystemEvent::FileDeleted {
                        path: path.clone(),
                        timestamp,
                    }
                }
            }
            BoardMessage::FolderCreated { element_id, name } => {
                let path = self.directory_path(name);
                self.lock()
                    .directories
                    .insert(path.clone(), element_id.clone());
                FileSystemEvent::DirectoryCreated {
                    path,
                    element_id: element_id.clone(),
                    timestamp,
                }
            }
            BoardMessage::FolderRenamed {
                element_id,
                old_name,
                new_name,
            } => {
                let old_path = self.directory_path(old_name);
                let new_path = self.directory_path(new_name);
                {
                    let mut state = self.lock();
                    state.directories.remove(&old_path);
                    state
                        .directories
                        .insert(new_path.clone(), element_id.clone());
                }
                FileSystemEvent::DirectoryRenamed {
                    old_path,
                    new_path,
                    element_id: element_id.clone(),
                    timestamp,
                }
            }
            other => {
                debug!("Ignoring {} message", other.name());
                return;
            }
        };
        self.events.emit(&event);
    }

    fn is_board_file(&self, path: &str) -> bool {
        path == board_file_path(&self.board_name)
    }

    fn directory_path(&self, name: &str) -> String {
        format!("{}/{}", self.board_name, name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolve an embeddable link to a path relative to the storage root.
///
/// Accepts absolute URLs and root-relative links. Only the URL path matters;
/// it must start with `prefix`. Returns `None` for links that do not point at
/// a file below the prefix.
pub fn resolve_link(link: &str, prefix: &str) -> Option<String> {
    let base = Url::parse(LINK_BASE).ok()?;
    let url = base.join(link.trim()).ok()?;
    let rest = url.path().strip_prefix(prefix)?;
    let path = urlencoding::decode(rest).ok()?.into_owned();
    if path.is_empty() || path.ends_with('/') {
        return None;
    }
    Some(path)
}

/// Build the link an embeddable uses to show the file at `path`.
pub fn file_link(path: &str, prefix: &str) -> String {
    let encoded: Vec<_> = path.split('/').map(urlencoding::encode).collect();
    format!("{}{}", prefix, encoded.join("/"))
}
