//! FileSystem trait abstraction for the board store.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in `native_fs`) - Uses tokio::fs under the storage root
//!
//! Paths are relative to the storage root and use `/` separators.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file or directory. Fails if `to` already exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Whether `path` exists and is a directory.
    async fn is_dir(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(stat) => Ok(stat.is_dir),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// All file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Remove a file, as an external program would. Returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.remove(&path).is_some()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn insert_dirs(dirs: &mut HashSet<String>, path: &str) {
        let mut current = Some(Self::normalize_path(path));
        while let Some(dir) = current {
            if dir.is_empty() || !dirs.insert(dir.clone()) {
                break;
            }
            current = Self::parent_path(&dir);
        }
    }

    /// Rewrite `path` if it is `from` or lies beneath it.
    fn moved(path: &str, from: &str, to: &str) -> Option<String> {
        if path == from {
            return Some(to.to_string());
        }
        path.strip_prefix(from)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| format!("{}/{}", to, rest))
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        {
            let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
            if dirs.contains(&path) {
                return Err(FsError::IsDirectory(path));
            }
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        if let Some(content) = files.get(&path) {
            return Ok(FileStat {
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if dirs.contains(&path) {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        Self::insert_dirs(&mut dirs, path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        if !self.exists(&from).await? {
            return Err(FsError::NotFound(from));
        }
        if self.exists(&to).await? {
            return Err(FsError::AlreadyExists(to));
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());

        let moved_files: Vec<(String, String)> = files
            .keys()
            .filter_map(|path| Self::moved(path, &from, &to).map(|new| (path.clone(), new)))
            .collect();
        for (old, new) in moved_files {
            if let Some(content) = files.remove(&old) {
                files.insert(new, content);
            }
        }

        let moved_dirs: Vec<(String, String)> = dirs
            .iter()
            .filter_map(|path| Self::moved(path, &from, &to).map(|new| (path.clone(), new)))
            .collect();
        for (old, new) in moved_dirs {
            dirs.remove(&old);
            dirs.insert(new);
        }
        if let Some(parent) = Self::parent_path(&to) {
            Self::insert_dirs(&mut dirs, &parent);
        }
        Ok(())
    }
}
