//! Board store: applies client messages to the storage root.
//!
//! Each board is a directory under the root holding its files, one folder per
//! frame and the `board.json` snapshot. The store also keeps the frame registry
//! and the content hash record, and tells the caller who should hear about each
//! change via [`Outbound`] values. It never talks to the network itself.

use std::collections::HashMap;

use board_sync::model::{board_file_path, BOARD_FILE, FRAME_TYPE};
use board_sync::{BoardMessage, BoardSnapshot, FileKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs::{FileSystem, FsError};
use crate::hash::{board_of, ContentHash, FileHashes};

/// Maximum length of a storage path.
pub const MAX_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Path {path:?} is outside board {board:?}")]
    OutsideBoard { path: String, board: String },

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Session has not joined a board")]
    NotJoined,

    #[error("Unexpected message from client: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Corrupt board file for {board}: {source}")]
    CorruptSnapshot {
        board: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode board: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Who should receive an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// The session that sent the request.
    Sender,
    /// Every other session on the same board.
    Others,
    /// Every session on the board.
    Board,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub audience: Audience,
    pub message: BoardMessage,
}

impl Outbound {
    fn sender(message: BoardMessage) -> Self {
        Self {
            audience: Audience::Sender,
            message,
        }
    }

    fn others(message: BoardMessage) -> Self {
        Self {
            audience: Audience::Others,
            message,
        }
    }
}

/// A frame known to the hub and the folder that backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEntry {
    pub name: String,
    pub element_type: &'static str,
}

impl FrameEntry {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            element_type: FRAME_TYPE,
        }
    }
}

/// Validate a storage path relative to the root.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason| {
        Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return invalid("empty");
    }
    if path.len() > MAX_PATH_LEN {
        return invalid("too long");
    }
    if path.starts_with('/') {
        return invalid("absolute path");
    }
    if path.contains('\\') {
        return invalid("backslash");
    }
    if path.contains('\0') {
        return invalid("NUL byte");
    }
    if path.chars().any(char::is_control) {
        return invalid("control character");
    }
    // Windows drive letters (C:)
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return invalid("drive letter");
    }
    for segment in path.split('/') {
        match segment {
            "" => return invalid("empty segment"),
            "." | ".." => return invalid("traversal"),
            _ => {}
        }
    }
    Ok(())
}

/// Validate a single path segment such as a board or folder name.
pub fn validate_name(name: &str) -> Result<()> {
    validate_path(name)?;
    if name.contains('/') {
        return Err(StoreError::InvalidPath {
            path: name.to_string(),
            reason: "nested name",
        });
    }
    Ok(())
}

fn ensure_in_board(board: &str, path: &str) -> Result<()> {
    match path.strip_prefix(board).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(StoreError::OutsideBoard {
            path: path.to_string(),
            board: board.to_string(),
        }),
    }
}

/// Check a client-supplied file path and resolve its kind.
fn validate_file(board: &str, path: &str) -> Result<FileKind> {
    validate_path(path)?;
    ensure_in_board(board, path)?;
    if path == board_file_path(board) {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason: "reserved",
        });
    }
    FileKind::from_path(path).ok_or_else(|| StoreError::UnsupportedFile(path.to_string()))
}

pub struct BoardStore<F> {
    fs: F,
    hashes: FileHashes,
    frames: HashMap<String, HashMap<String, FrameEntry>>,
}

impl<F: FileSystem> BoardStore<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            hashes: FileHashes::new(),
            frames: HashMap::new(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn hashes(&self) -> &FileHashes {
        &self.hashes
    }

    pub fn frame(&self, board: &str, element_id: &str) -> Option<&FrameEntry> {
        self.frames.get(board)?.get(element_id)
    }

    /// Apply a message from a session. `board` is the board it joined, if any.
    pub async fn apply(&mut self, board: Option<&str>, message: BoardMessage) -> Result<Vec<Outbound>> {
        if let BoardMessage::JoinBoard { board_name } = &message {
            return self.join(board_name).await;
        }
        let name = message.name();
        let board = board.ok_or(StoreError::NotJoined)?;

        match message {
            BoardMessage::CreateFile { path } => self.create_file(board, &path).await,
            BoardMessage::UpdateFile { path, content } => {
                self.update_file(board, &path, content).await
            }
            BoardMessage::UpdateState {
                board_name,
                board: snapshot,
                request_id,
            } => {
                if board_name != board {
                    return Err(StoreError::OutsideBoard {
                        path: board_name,
                        board: board.to_string(),
                    });
                }
                self.update_state(board, snapshot, request_id).await
            }
            BoardMessage::CreateDirectory { element_id, name } => {
                self.create_directory(board, element_id, &name).await
            }
            BoardMessage::FolderRenamed {
                element_id,
                old_name,
                new_name,
            } => self.rename_folder(board, element_id, &old_name, &new_name).await,
            _ => Err(StoreError::UnexpectedMessage(name)),
        }
    }

    /// Make sure the board exists and hand the joiner its snapshot.
    pub async fn join(&mut self, board: &str) -> Result<Vec<Outbound>> {
        validate_name(board)?;
        self.fs.mkdir(board).await?;

        match self.load_snapshot(board).await? {
            Some(snapshot) => Ok(vec![Outbound::sender(BoardMessage::BoardUpdate {
                board_name: board.to_string(),
                board: snapshot,
            })]),
            None => Ok(Vec::new()),
        }
    }

    /// Read `board.json`, recording its hash and registering its frames.
    pub async fn load_snapshot(&mut self, board: &str) -> Result<Option<BoardSnapshot>> {
        let path = board_file_path(board);
        let bytes = match self.fs.read(&path).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = parse_snapshot(board, &bytes)?;
        self.hashes.record(&path, ContentHash::from_content(&bytes));
        self.register_frames(board, &snapshot);
        Ok(Some(snapshot))
    }

    async fn create_file(&mut self, board: &str, path: &str) -> Result<Vec<Outbound>> {
        let kind = validate_file(board, path)?;
        if self.fs.exists(path).await? {
            debug!("{} already exists, not creating", path);
            return Ok(Vec::new());
        }

        self.fs.write(path, &[]).await?;
        self.hashes.record(path, ContentHash::from_content(&[]));
        info!("Created {}", path);
        Ok(vec![Outbound::others(BoardMessage::FileAdded {
            path: path.to_string(),
            kind,
        })])
    }

    async fn update_file(&mut self, board: &str, path: &str, content: String) -> Result<Vec<Outbound>> {
        let kind = validate_file(board, path)?;
        let hash = ContentHash::from_content(content.as_bytes());
        if self.hashes.matches(path, &hash) {
            debug!("{} unchanged, skipping write", path);
            return Ok(Vec::new());
        }

        let existed = self.fs.exists(path).await?;
        self.fs.write(path, content.as_bytes()).await?;
        self.hashes.record(path, hash);
        debug!("Wrote {} ({} bytes)", path, content.len());

        let message = if existed {
            BoardMessage::FileChanged {
                path: path.to_string(),
                content,
            }
        } else {
            BoardMessage::FileAdded {
                path: path.to_string(),
                kind,
            }
        };
        Ok(vec![Outbound::others(message)])
    }

    async fn update_state(
        &mut self,
        board: &str,
        snapshot: BoardSnapshot,
        request_id: String,
    ) -> Result<Vec<Outbound>> {
        let path = board_file_path(board);
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let hash = ContentHash::from_content(&bytes);

        let mut outbound = vec![Outbound::sender(BoardMessage::StateSaved {
            board_name: board.to_string(),
            request_id,
        })];

        if self.hashes.matches(&path, &hash) {
            debug!("State of {} unchanged", board);
            return Ok(outbound);
        }

        self.fs.write(&path, &bytes).await?;
        self.hashes.record(&path, hash);
        self.register_frames(board, &snapshot);
        debug!("Saved state of {} ({} elements)", board, snapshot.elements.len());

        outbound.push(Outbound::others(BoardMessage::BoardUpdate {
            board_name: board.to_string(),
            board: snapshot,
        }));
        Ok(outbound)
    }

    async fn create_directory(
        &mut self,
        board: &str,
        element_id: String,
        name: &str,
    ) -> Result<Vec<Outbound>> {
        validate_name(name)?;
        let dir = format!("{}/{}", board, name);

        if self.fs.is_dir(&dir).await? {
            debug!("Folder {} already exists", dir);
        } else if self.fs.exists(&dir).await? {
            return Err(StoreError::InvalidPath {
                path: dir,
                reason: "a file with that name exists",
            });
        } else {
            self.fs.mkdir(&dir).await?;
            info!("Created folder {} for frame {}", dir, element_id);
        }

        self.board_frames(board)
            .insert(element_id.clone(), FrameEntry::new(name));
        Ok(vec![Outbound::others(BoardMessage::FolderCreated {
            element_id,
            name: name.to_string(),
        })])
    }

    async fn rename_folder(
        &mut self,
        board: &str,
        element_id: String,
        old_name: &str,
        new_name: &str,
    ) -> Result<Vec<Outbound>> {
        validate_name(old_name)?;
        validate_name(new_name)?;
        if old_name == new_name {
            return Ok(Vec::new());
        }

        let old_dir = format!("{}/{}", board, old_name);
        let new_dir = format!("{}/{}", board, new_name);
        let old_exists = self.fs.is_dir(&old_dir).await?;
        let new_exists = self.fs.is_dir(&new_dir).await?;

        let outbound = match (old_exists, new_exists) {
            (true, false) => {
                self.fs.rename(&old_dir, &new_dir).await?;
                self.hashes.move_dir(&old_dir, &new_dir);
                info!("Renamed folder {} to {}", old_dir, new_dir);
                vec![Outbound::others(BoardMessage::FolderRenamed {
                    element_id: element_id.clone(),
                    old_name: old_name.to_string(),
                    new_name: new_name.to_string(),
                })]
            }
            (false, false) => {
                self.fs.mkdir(&new_dir).await?;
                info!("Folder {} missing, created {}", old_dir, new_dir);
                vec![Outbound::others(BoardMessage::FolderCreated {
                    element_id: element_id.clone(),
                    name: new_name.to_string(),
                })]
            }
            (false, true) => {
                debug!("Folder {} already renamed to {}", old_dir, new_dir);
                Vec::new()
            }
            (true, true) => {
                warn!(
                    "Both {} and {} exist, leaving folders untouched for frame {}",
                    old_dir, new_dir, element_id
                );
                Vec::new()
            }
        };

        self.board_frames(board)
            .insert(element_id, FrameEntry::new(new_name));
        Ok(outbound)
    }

    /// Turn a change seen by the watcher into a notification for the board.
    ///
    /// Returns `None` for changes the hub made itself and for files boards
    /// cannot hold.
    pub async fn external_change(&mut self, path: &str) -> Result<Option<BoardMessage>> {
        validate_path(path)?;
        let board = board_of(path);
        if board == path {
            return Ok(None);
        }

        if path == board_file_path(board) {
            return self.external_state_change(board).await;
        }

        let Some(kind) = FileKind::from_path(path) else {
            return Ok(None);
        };

        if !self.fs.exists(path).await? {
            self.hashes.forget(path);
            return Ok(Some(BoardMessage::FileDeleted {
                path: path.to_string(),
            }));
        }
        if self.fs.is_dir(path).await? {
            return Ok(None);
        }

        let bytes = self.fs.read(path).await?;
        let known = self.hashes.get(path).is_some();
        if !self.hashes.record(path, ContentHash::from_content(&bytes)) {
            debug!("Ignoring echo of our own write to {}", path);
            return Ok(None);
        }

        let message = if known && kind.is_text() {
            BoardMessage::FileChanged {
                path: path.to_string(),
                content: String::from_utf8_lossy(&bytes).into_owned(),
            }
        } else {
            // Binary files carry no inline content; viewers reload them.
            BoardMessage::FileAdded {
                path: path.to_string(),
                kind,
            }
        };
        Ok(Some(message))
    }

    async fn external_state_change(&mut self, board: &str) -> Result<Option<BoardMessage>> {
        let path = board_file_path(board);
        if !self.fs.exists(&path).await? {
            info!("{} removed, forgetting board {}", BOARD_FILE, board);
            self.hashes.forget_board(board);
            self.frames.remove(board);
            return Ok(None);
        }

        let bytes = self.fs.read(&path).await?;
        if self.hashes.matches(&path, &ContentHash::from_content(&bytes)) {
            return Ok(None);
        }
        let snapshot = parse_snapshot(board, &bytes)?;
        self.hashes.record(&path, ContentHash::from_content(&bytes));
        self.register_frames(board, &snapshot);
        Ok(Some(BoardMessage::BoardUpdate {
            board_name: board.to_string(),
            board: snapshot,
        }))
    }

    fn board_frames(&mut self, board: &str) -> &mut HashMap<String, FrameEntry> {
        self.frames.entry(board.to_string()).or_default()
    }

    /// Register frames that first appear in a snapshot.
    fn register_frames(&mut self, board: &str, snapshot: &BoardSnapshot) {
        let structure = snapshot.structure();
        let frames = self.board_frames(board);
        for frame in structure.frames() {
            frames
                .entry(frame.id.clone())
                .or_insert_with(|| FrameEntry::new(frame.display_name()));
        }
    }
}

fn parse_snapshot(board: &str, bytes: &[u8]) -> Result<BoardSnapshot> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::CorruptSnapshot {
        board: board.to_string(),
        source,
    })
}
