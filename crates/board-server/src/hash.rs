//! Content hashes of the files the hub has written or observed.
//!
//! The record lets the hub skip redundant writes and recognise watcher events
//! caused by its own writes. Entries are grouped by board so a board can be
//! evicted as a whole.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// SHA-256 of a file's bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Board name of a storage path (its first segment).
pub fn board_of(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}

/// Last known content hash per path, scoped by board.
#[derive(Debug, Default)]
pub struct FileHashes {
    boards: HashMap<String, HashMap<String, ContentHash>>,
}

impl FileHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash` for `path`. Returns false when it was already recorded.
    pub fn record(&mut self, path: &str, hash: ContentHash) -> bool {
        let files = self.boards.entry(board_of(path).to_string()).or_default();
        match files.get(path) {
            Some(existing) if *existing == hash => false,
            _ => {
                files.insert(path.to_string(), hash);
                true
            }
        }
    }

    pub fn matches(&self, path: &str, hash: &ContentHash) -> bool {
        self.get(path) == Some(hash)
    }

    pub fn get(&self, path: &str) -> Option<&ContentHash> {
        self.boards.get(board_of(path))?.get(path)
    }

    pub fn forget(&mut self, path: &str) -> Option<ContentHash> {
        let board = board_of(path);
        let files = self.boards.get_mut(board)?;
        let removed = files.remove(path);
        if files.is_empty() {
            self.boards.remove(board);
        }
        removed
    }

    pub fn forget_board(&mut self, board: &str) {
        self.boards.remove(board);
    }

    /// Carry the entries under directory `from` over to `to`.
    pub fn move_dir(&mut self, from: &str, to: &str) {
        let Some(files) = self.boards.get_mut(board_of(from)) else {
            return;
        };
        let prefix = format!("{}/", from);
        let moved: Vec<(String, ContentHash)> = files
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, hash)| (path.clone(), hash.clone()))
            .collect();
        for (path, hash) in moved {
            files.remove(&path);
            files.insert(format!("{}/{}", to, &path[prefix.len()..]), hash);
        }
    }

    pub fn len(&self) -> usize {
        self.boards.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
