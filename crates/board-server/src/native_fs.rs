//! Native filesystem implementation using tokio::fs.

use crate::fs::{FileStat, FileSystem, FsError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Native filesystem rooted at the board storage directory
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn io_error(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;

        Ok(FileStat {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.full_path(to);
        // std's rename silently replaces files and empty directories
        if self.exists(to).await? {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(to, e))?;
        }
        fs::rename(self.full_path(from), target)
            .await
            .map_err(|e| io_error(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_and_stat() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("demo/notes.md", b"# Notes").await.unwrap();

        assert_eq!(fs.read("demo/notes.md").await.unwrap(), b"# Notes");
        assert!(fs.is_dir("demo").await.unwrap());
        assert!(!fs.stat("demo/notes.md").await.unwrap().is_dir);
        assert!(matches!(
            fs.read("demo/missing.md").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_directory() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        fs.write("demo/Draft/a.md", b"a").await.unwrap();

        fs.rename("demo/Draft", "demo/Final").await.unwrap();

        assert!(!fs.exists("demo/Draft").await.unwrap());
        assert_eq!(fs.read("demo/Final/a.md").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        fs.mkdir("demo/A").await.unwrap();
        fs.mkdir("demo/B").await.unwrap();

        assert!(matches!(
            fs.rename("demo/A", "demo/B").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(fs.is_dir("demo/A").await.unwrap());
    }
}
