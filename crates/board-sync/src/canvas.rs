//! CanvasDocument trait abstraction over the whiteboard host.
//!
//! Implementations:
//! - `InMemoryCanvas` - For testing and headless hosts
//! - Browser hosts wrap the whiteboard library's scene API

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::model::{BoardSnapshot, CanvasElement};

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("Canvas rejected update: {0}")]
    Rejected(String),

    #[error("Canvas unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, CanvasError>;

/// Called by the host after every document mutation with the full element
/// list and the current app state.
pub type ChangeHook = Arc<dyn Fn(&[CanvasElement], &Value) + Send + Sync>;

/// Capabilities the sync core needs from the canvas host.
pub trait CanvasDocument: Send + Sync {
    /// Full element list, including deleted and unsupported records.
    fn elements(&self) -> Vec<CanvasElement>;

    fn app_state(&self) -> Value;

    /// Binary file metadata attached to the scene.
    fn files(&self) -> Value;

    /// Replace the element list.
    fn replace_elements(&self, elements: Vec<CanvasElement>) -> Result<()>;

    /// Install (or clear) the change notification hook.
    fn set_change_hook(&self, hook: Option<ChangeHook>);

    fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            elements: self.elements(),
            app_state: self.app_state(),
            files: self.files(),
        }
    }
}

#[derive(Default)]
struct Scene {
    elements: Vec<CanvasElement>,
    app_state: Value,
    files: Value,
}

/// In-memory canvas that fires its change hook on every mutation, like a
/// real whiteboard does for both user edits and programmatic updates.
#[derive(Default)]
pub struct InMemoryCanvas {
    scene: Mutex<Scene>,
    hook: Mutex<Option<ChangeHook>>,
    fail_writes: AtomicBool,
}

impl InMemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(elements: Vec<CanvasElement>) -> Self {
        let canvas = Self::new();
        canvas.scene.lock().unwrap_or_else(|e| e.into_inner()).elements = elements;
        canvas
    }

    /// Simulate an interactive edit: mutate the scene, then notify.
    pub fn edit(&self, f: impl FnOnce(&mut Vec<CanvasElement>)) {
        {
            let mut scene = self.scene.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut scene.elements);
        }
        self.notify();
    }

    pub fn set_app_state(&self, app_state: Value) {
        self.scene.lock().unwrap_or_else(|e| e.into_inner()).app_state = app_state;
    }

    /// Make subsequent `replace_elements` calls fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn find(&self, id: &str) -> Option<CanvasElement> {
        self.scene
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elements
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    fn notify(&self) {
        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            let (elements, app_state) = {
                let scene = self.scene.lock().unwrap_or_else(|e| e.into_inner());
                (scene.elements.clone(), scene.app_state.clone())
            };
            hook(&elements, &app_state);
        }
    }
}

impl CanvasDocument for InMemoryCanvas {
    fn elements(&self) -> Vec<CanvasElement> {
        self.scene
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elements
            .clone()
    }

    fn app_state(&self) -> Value {
        self.scene
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .app_state
            .clone()
    }

    fn files(&self) -> Value {
        self.scene
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .files
            .clone()
    }

    fn replace_elements(&self, elements: Vec<CanvasElement>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CanvasError::Rejected("writes disabled".into()));
        }
        self.scene.lock().unwrap_or_else(|e| e.into_inner()).elements = elements;
        self.notify();
        Ok(())
    }

    fn set_change_hook(&self, hook: Option<ChangeHook>) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }
}
