//! Structure manager: reconciles the canvas document with the remote store.
//!
//! Local document changes are turned into filesystem requests, remote state
//! is merged into the document with conflict detection, and every outcome is
//! published as a `SyncEvent` on the session's event bus.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::document::{DocumentAdapter, DocumentEvent};
use crate::error::{AdapterError, Result};
use crate::events::{EventBus, Subscription, SYNC_FILESYSTEM_TOPIC, SYNC_TOPIC};
use crate::filesystem::{FileSystemEvent, FilesystemAdapter};
use crate::model::{board_file_path, BoardSnapshot, CanvasElement, Element, ElementKind, Structure};

/// How differing versions of one element are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// The version with the newer `updated` stamp wins.
    #[default]
    LatestWins,
    LocalWins,
    RemoteWins,
}

/// Synchronization options. Fields left out take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Push local changes to the remote store.
    pub bidirectional: bool,
    pub conflict_resolution: ConflictResolution,
    /// Start syncing as soon as the manager is initialized.
    pub auto_sync: bool,
    /// Period of the recurring forced sync. `None` or zero disables it.
    pub sync_interval_ms: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            bidirectional: true,
            conflict_resolution: ConflictResolution::LatestWins,
            auto_sync: true,
            sync_interval_ms: None,
        }
    }
}

/// An element whose local version is newer than the remote one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub element_id: String,
    pub local: CanvasElement,
    pub remote: CanvasElement,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_active: bool,
    pub last_sync_time: Option<u64>,
    pub pending_changes: bool,
    pub conflicts: Vec<SyncConflict>,
}

impl SyncStatus {
    /// Status right after a reset: active, never synced, nothing pending.
    pub fn fresh() -> Self {
        Self {
            is_active: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    SyncStarted { timestamp: u64 },
    /// `persisted` is set when a forced sync wrote the board. Stopping the
    /// sync completes without persisting anything.
    SyncCompleted { timestamp: u64, persisted: bool },
    SyncFailed { error: String, timestamp: u64 },
    ConflictDetected { conflict: SyncConflict, timestamp: u64 },
    ChangeApplied { path: String, timestamp: u64 },
}

/// Payloads carried by a session's event bus.
#[derive(Debug, Clone)]
pub enum BusPayload {
    /// Every sync event, on `SYNC_TOPIC`.
    Sync(SyncEvent),
    /// Structure captured by a forced sync, on `SYNC_FILESYSTEM_TOPIC`.
    Structure(Structure),
}

/// Lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Idle { active: bool },
    Syncing,
}

struct ManagerState {
    phase: SessionState,
    options: SyncOptions,
    status: SyncStatus,
    next_interval: Option<u64>,
    subscriptions: Vec<Subscription>,
}

pub struct StructureManager {
    clock: SharedClock,
    document: Arc<DocumentAdapter>,
    filesystem: Arc<FilesystemAdapter>,
    bus: Arc<EventBus<BusPayload>>,
    state: Mutex<ManagerState>,
    self_ref: Weak<StructureManager>,
}

impl StructureManager {
    pub fn new(
        clock: SharedClock,
        document: Arc<DocumentAdapter>,
        filesystem: Arc<FilesystemAdapter>,
        bus: Arc<EventBus<BusPayload>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            clock,
            document,
            filesystem,
            bus,
            state: Mutex::new(ManagerState {
                phase: SessionState::Uninitialized,
                options: SyncOptions::default(),
                status: SyncStatus::default(),
                next_interval: None,
                subscriptions: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Wire both adapters and, with `auto_sync`, start syncing.
    pub fn initialize(&self, options: SyncOptions) -> Result<()> {
        {
            let mut state = self.lock();
            if state.phase != SessionState::Uninitialized {
                warn!("Structure manager already initialized");
                return Ok(());
            }
            state.phase = SessionState::Initializing;
            state.options = options.clone();
        }

        let manager = self.self_ref.clone();
        let document_sub = self.document.subscribe(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.on_document_event(event);
            }
        });
        let manager = self.self_ref.clone();
        let filesystem_sub = self.filesystem.subscribe(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.on_filesystem_event(event);
            }
        });

        if let Err(e) = self.filesystem.initialize() {
            let mut state = self.lock();
            state.phase = SessionState::Uninitialized;
            return Err(e);
        }

        {
            let mut state = self.lock();
            state.subscriptions = vec![document_sub, filesystem_sub];
            state.phase = SessionState::Idle { active: false };
            state.next_interval = match options.sync_interval_ms {
                Some(interval) if interval > 0 && options.bidirectional && options.auto_sync => {
                    Some(self.clock.now_ms().saturating_add(interval))
                }
                _ => None,
            };
        }
        info!(
            "Structure manager initialized for board {}",
            self.filesystem.board_name()
        );

        if options.auto_sync {
            self.start_sync();
        }
        Ok(())
    }

    pub fn start_sync(&self) {
        {
            let mut state = self.lock();
            match state.phase {
                SessionState::Idle { active: false } => {}
                SessionState::Uninitialized | SessionState::Initializing => {
                    warn!("Cannot start sync before initialization");
                    return;
                }
                _ => return,
            }
            state.phase = SessionState::Idle { active: true };
            state.status.is_active = true;
        }
        self.emit(SyncEvent::SyncStarted {
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn stop_sync(&self) {
        {
            let mut state = self.lock();
            if !state.status.is_active {
                return;
            }
            state.phase = SessionState::Idle { active: false };
            state.status.is_active = false;
        }
        self.emit(SyncEvent::SyncCompleted {
            timestamp: self.clock.now_ms(),
            persisted: false,
        });
    }

    /// Switch activity without publishing lifecycle events. An uninitialized
    /// manager stays inactive.
    pub fn set_active(&self, active: bool) {
        let mut state = self.lock();
        match state.phase {
            SessionState::Idle { .. } => state.phase = SessionState::Idle { active },
            SessionState::Syncing => {}
            SessionState::Uninitialized | SessionState::Initializing => {
                state.status.is_active = false;
                return;
            }
        }
        state.status.is_active = active;
    }

    /// Replace the status with a fresh one. Only an initialized manager is
    /// reported active.
    pub fn reset_status(&self) {
        let mut state = self.lock();
        state.status = SyncStatus::fresh();
        match state.phase {
            SessionState::Idle { .. } => state.phase = SessionState::Idle { active: true },
            SessionState::Syncing => {}
            SessionState::Uninitialized | SessionState::Initializing => {
                state.status.is_active = false;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().status.is_active
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.lock().status.clone()
    }

    pub fn options(&self) -> SyncOptions {
        self.lock().options.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().phase
    }

    pub fn subscribe(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.bus.subscribe(SYNC_TOPIC, move |envelope| {
            if let BusPayload::Sync(event) = &envelope.payload {
                callback(event);
            }
        })
    }

    /// Capture the structure and persist the document right away.
    ///
    /// Failures are reported as `SyncFailed`, never returned.
    pub fn force_sync(&self) {
        let previous = {
            let mut state = self.lock();
            match state.phase {
                SessionState::Idle { active: true } => {}
                SessionState::Idle { active: false } => {
                    debug!("Sync inactive, skipping forced sync");
                    return;
                }
                phase => {
                    debug!("Skipping forced sync in state {:?}", phase);
                    return;
                }
            }
            std::mem::replace(&mut state.phase, SessionState::Syncing)
        };

        let result = self.persist_document();
        self.lock().phase = previous;

        let timestamp = self.clock.now_ms();
        match result {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.status.last_sync_time = Some(timestamp);
                    state.status.pending_changes = false;
                }
                debug!("Forced sync completed");
                self.emit(SyncEvent::SyncCompleted {
                    timestamp,
                    persisted: true,
                });
            }
            Err(AdapterError::NotAttached) => {
                debug!("No document attached, nothing to sync");
            }
            Err(e) => {
                warn!("Forced sync failed: {}", e);
                self.emit(SyncEvent::SyncFailed {
                    error: e.to_string(),
                    timestamp,
                });
            }
        }
    }

    /// Run the recurring sync when it is due.
    pub fn tick(&self, now: u64) {
        let due = {
            let mut state = self.lock();
            match (state.next_interval, state.options.sync_interval_ms) {
                (Some(deadline), Some(interval)) if now >= deadline => {
                    state.next_interval = Some(now.saturating_add(interval));
                    state.status.is_active
                }
                _ => false,
            }
        };
        if due {
            self.force_sync();
        }
    }

    pub fn shutdown(&self) {
        let subscriptions = {
            let mut state = self.lock();
            state.phase = SessionState::Uninitialized;
            state.status.is_active = false;
            state.next_interval = None;
            std::mem::take(&mut state.subscriptions)
        };
        drop(subscriptions);
    }

    fn persist_document(&self) -> Result<()> {
        let snapshot = self.document.snapshot()?;
        let structure = snapshot.structure();
        self.bus
            .publish(SYNC_FILESYSTEM_TOPIC, BusPayload::Structure(structure));
        self.filesystem.persist_board_state(snapshot)
    }

    /// Forwards local changes whenever syncing is bidirectional, active or
    /// not. The filesystem adapter holds requests until the hub is reachable.
    fn on_document_event(&self, event: &DocumentEvent) {
        let bidirectional = {
            let mut state = self.lock();
            state.status.pending_changes = true;
            state.options.bidirectional
        };
        if !bidirectional {
            return;
        }

        let result = match event {
            DocumentEvent::ElementAdded(element) => self.create_remote(element),
            DocumentEvent::ElementUpdated { previous, current } => {
                match (&previous.kind, &current.kind) {
                    (ElementKind::Frame { .. }, ElementKind::Frame { .. }) => {
                        let old_name = previous.display_name();
                        if old_name != current.display_name() {
                            self.filesystem.rename_directory(current, &old_name)
                        } else {
                            Ok(())
                        }
                    }
                    (
                        ElementKind::Embeddable { link: old_link },
                        ElementKind::Embeddable { link: new_link },
                    ) => {
                        if old_link != new_link {
                            self.filesystem.create_file(current)
                        } else {
                            Ok(())
                        }
                    }
                    _ => self.create_remote(current),
                }
            }
            DocumentEvent::ElementDeleted(element) => match element.kind {
                ElementKind::Embeddable { .. } => self.filesystem.remove_file(element),
                ElementKind::Frame { .. } => self.filesystem.remove_directory(element),
            },
            DocumentEvent::StructureChanged { .. } => {
                self.document.snapshot().map(|snapshot| {
                    self.filesystem.update_board_state(snapshot);
                })
            }
        };

        match result {
            Ok(()) => {}
            Err(AdapterError::Unsupported(what)) => debug!("Skipped unsupported {}", what),
            Err(e) => warn!("Failed to forward document change: {}", e),
        }
    }

    fn create_remote(&self, element: &Element) -> Result<()> {
        match element.kind {
            ElementKind::Embeddable { .. } => self.filesystem.create_file(element),
            ElementKind::Frame { .. } => self.filesystem.create_directory(element),
        }
    }

    fn on_filesystem_event(&self, event: &FileSystemEvent) {
        match event {
            FileSystemEvent::StateSync { snapshot, .. } => self.merge_remote(snapshot),
            FileSystemEvent::DirectoryRenamed {
                old_path,
                new_path,
                element_id,
                ..
            } => self.rename_frames(old_path, new_path, element_id),
            FileSystemEvent::FileCreated { path, .. }
            | FileSystemEvent::FileModified { path, .. }
            | FileSystemEvent::FileDeleted { path, .. }
            | FileSystemEvent::DirectoryCreated { path, .. }
            | FileSystemEvent::DirectoryDeleted { path, .. } => {
                self.emit(SyncEvent::ChangeApplied {
                    path: path.clone(),
                    timestamp: self.clock.now_ms(),
                });
            }
        }
    }

    /// Merge a remote snapshot into the document.
    fn merge_remote(&self, remote: &BoardSnapshot) {
        let local = match self.document.snapshot() {
            Ok(snapshot) => snapshot,
            Err(_) => {
                debug!("No document attached, ignoring remote state");
                return;
            }
        };
        let (resolution, push) = {
            let state = self.lock();
            (
                state.options.conflict_resolution,
                state.options.bidirectional && state.status.is_active,
            )
        };
        let now = self.clock.now_ms();

        let local_by_id: HashMap<&str, &CanvasElement> =
            local.elements.iter().map(|e| (e.id.as_str(), e)).collect();
        let newest_remote = remote.elements.iter().map(|e| e.updated).max().unwrap_or(0);

        let mut merged = Vec::with_capacity(remote.elements.len());
        let mut conflicts = Vec::new();
        let mut kept_local = false;

        for theirs in &remote.elements {
            match local_by_id.get(theirs.id.as_str()) {
                Some(ours) if *ours != theirs => {
                    if ours.updated > theirs.updated {
                        conflicts.push(SyncConflict {
                            element_id: theirs.id.clone(),
                            local: (*ours).clone(),
                            remote: theirs.clone(),
                            timestamp: now,
                        });
                    }
                    let take_local = match resolution {
                        ConflictResolution::LatestWins => ours.updated > theirs.updated,
                        ConflictResolution::LocalWins => true,
                        ConflictResolution::RemoteWins => false,
                    };
                    if take_local {
                        kept_local = true;
                        merged.push((*ours).clone());
                    } else {
                        merged.push(theirs.clone());
                    }
                }
                _ => merged.push(theirs.clone()),
            }
        }

        let remote_ids: std::collections::HashSet<&str> =
            remote.elements.iter().map(|e| e.id.as_str()).collect();
        for ours in &local.elements {
            if remote_ids.contains(ours.id.as_str()) {
                continue;
            }
            let keep = match resolution {
                ConflictResolution::LatestWins => ours.updated > newest_remote,
                ConflictResolution::LocalWins => true,
                ConflictResolution::RemoteWins => false,
            };
            if keep {
                kept_local = true;
                merged.push(ours.clone());
            }
        }

        if merged != local.elements {
            if let Err(e) = self.document.apply_snapshot(merged) {
                error!("Failed to apply remote state: {}", e);
                return;
            }
        } else {
            debug!("Remote state matches the document");
        }

        for conflict in conflicts {
            warn!("Conflict on element {}", conflict.element_id);
            self.lock().status.conflicts.push(conflict.clone());
            self.emit(SyncEvent::ConflictDetected {
                conflict,
                timestamp: now,
            });
        }
        self.emit(SyncEvent::ChangeApplied {
            path: board_file_path(self.filesystem.board_name()),
            timestamp: now,
        });

        if kept_local && push {
            match self.document.snapshot() {
                Ok(snapshot) => self.filesystem.update_board_state(snapshot),
                Err(e) => debug!("Cannot push merged state: {}", e),
            }
        }
    }

    /// Apply a remote directory rename to every matching frame.
    fn rename_frames(&self, old_path: &str, new_path: &str, element_id: &str) {
        let old_name = last_segment(old_path);
        let new_name = last_segment(new_path);
        let timestamp = self.clock.now_ms();

        let mut snapshot = match self.document.snapshot() {
            Ok(snapshot) => snapshot,
            Err(_) => {
                debug!("No document attached, ignoring directory rename");
                return;
            }
        };

        let mut renamed = 0;
        for record in snapshot.elements.iter_mut() {
            let Some(element) = Element::from_canvas(record) else {
                continue;
            };
            if !element.is_frame() || element.display_name() == new_name {
                continue;
            }
            if element.id == element_id || element.display_name() == old_name {
                record.name = Some(new_name.to_string());
                record.updated = record.updated.max(timestamp);
                renamed += 1;
            }
        }

        if renamed > 0 {
            // Written under the document guard so the rename is not echoed back.
            if let Err(e) = self.document.apply_snapshot(snapshot.elements) {
                error!("Failed to rename frames: {}", e);
                return;
            }
            debug!("Renamed {} frame(s) {} -> {}", renamed, old_name, new_name);
        }
        self.emit(SyncEvent::ChangeApplied {
            path: new_path.to_string(),
            timestamp,
        });
    }

    fn emit(&self, event: SyncEvent) {
        self.bus.publish(SYNC_TOPIC, BusPayload::Sync(event));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
