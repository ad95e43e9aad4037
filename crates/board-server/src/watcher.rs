//! File watcher with debouncing for the board storage root.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Events
//! only name the path; the store decides by content hash whether anything
//! actually changed.

use anyhow::Result;
use board_sync::model::BOARD_FILE;
use board_sync::FileKind;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Default debounce period for filesystem events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// A file under the storage root changed, appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to the storage root, `/` separated
    pub path: String,
}

/// File watcher that monitors the storage root.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, debounce: Duration) -> Result<Self> {
        // FSEvents reports canonical paths (/private/var on macOS).
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callback_root = root.clone();

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &callback_root) {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(event: &DebouncedEvent, root: &Path) -> Option<FileEvent> {
        let relative = event.path.strip_prefix(root).ok()?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");

        if !is_watched(&path) {
            return None;
        }

        debug!("File event: {}", path);
        Some(FileEvent { path })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether a relative path is something boards hold.
pub fn is_watched(path: &str) -> bool {
    // Hidden files and directories (editor swap files, .git)
    if path.is_empty() || path.starts_with('.') || path.contains("/.") {
        return false;
    }
    // Files live inside a board folder
    let Some((_, name)) = path.rsplit_once('/') else {
        return false;
    };
    name == BOARD_FILE || FileKind::from_path(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_watched() {
        assert!(is_watched("demo/notes.md"));
        assert!(is_watched("demo/Research/paper.pdf"));
        assert!(is_watched("demo/board.json"));
        assert!(is_watched("demo/todo.txt"));

        assert!(!is_watched("notes.md"));
        assert!(!is_watched("demo/image.png"));
        assert!(!is_watched("demo/.notes.md.swp"));
        assert!(!is_watched(".git/config"));
        assert!(!is_watched("demo/Research"));
    }
}
