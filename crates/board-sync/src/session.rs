//! Sync session: owns one board's adapters, manager and event bus, and
//! coordinates sync health.
//!
//! A circuit breaker counts consecutive sync failures. Once it trips, syncing
//! is paused for an exponentially growing delay and resumed by `tick()` with a
//! trial sync. Transport reconnects and successful syncs reset the count.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::canvas::CanvasDocument;
use crate::clock::SharedClock;
use crate::document::DocumentAdapter;
use crate::events::{EventBus, Subscription};
use crate::filesystem::FilesystemAdapter;
use crate::manager::{
    BusPayload, SessionState, StructureManager, SyncEvent, SyncOptions, SyncStatus,
};
use crate::transport::{DisconnectReason, Transport, TransportEvent};

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub threshold: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub board_name: String,
    #[serde(default)]
    pub options: SyncOptions,
    #[serde(default = "default_change_debounce_ms")]
    pub change_debounce_ms: u64,
    #[serde(default = "default_state_debounce_ms")]
    pub state_debounce_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// URL path prefix under which embeddable links address board files.
    #[serde(default = "default_files_prefix")]
    pub files_prefix: String,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default = "default_reset_sync_delay_ms")]
    pub reset_sync_delay_ms: u64,
    #[serde(default = "default_initial_sync_delay_ms")]
    pub initial_sync_delay_ms: u64,
}

fn default_change_debounce_ms() -> u64 {
    300
}

fn default_state_debounce_ms() -> u64 {
    500
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_files_prefix() -> String {
    "/files/".to_string()
}

fn default_reset_sync_delay_ms() -> u64 {
    500
}

fn default_initial_sync_delay_ms() -> u64 {
    1_000
}

impl SessionConfig {
    pub fn new(board_name: impl Into<String>) -> Self {
        Self {
            board_name: board_name.into(),
            options: SyncOptions::default(),
            change_debounce_ms: default_change_debounce_ms(),
            state_debounce_ms: default_state_debounce_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            files_prefix: default_files_prefix(),
            breaker: BreakerConfig::default(),
            reset_sync_delay_ms: default_reset_sync_delay_ms(),
            initial_sync_delay_ms: default_initial_sync_delay_ms(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }
}

/// Pauses syncing after repeated failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    failures: u32,
    open_until: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            failures: 0,
            open_until: None,
        }
    }

    /// Count a failure. Returns the reopen deadline if the breaker trips.
    pub fn record_failure(&mut self, now: u64) -> Option<u64> {
        self.failures = self.failures.saturating_add(1);
        if self.failures < self.config.threshold {
            return None;
        }
        let deadline = now.saturating_add(self.backoff());
        self.open_until = Some(deadline);
        Some(deadline)
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.open_until = None;
    }

    /// Pause length for the current failure count:
    /// `min(base * 2^(failures - threshold), max)`.
    pub fn backoff(&self) -> u64 {
        let exponent = self.failures.saturating_sub(self.config.threshold);
        self.config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.config.max_delay_ms)
    }

    /// Whether the pause ended at `now`. Closes the breaker when it did.
    pub fn take_reopen(&mut self, now: u64) -> bool {
        match self.open_until {
            Some(deadline) if now >= deadline => {
                self.open_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_until.is_some()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn open_until(&self) -> Option<u64> {
        self.open_until
    }
}

/// What the UI shows for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncIndicator {
    Active,
    Inactive,
    Error,
}

struct SessionInner {
    breaker: CircuitBreaker,
    error: Option<String>,
    scheduled_sync: Option<u64>,
    attached_once: bool,
    /// Between `initialize` and `shutdown`.
    started: bool,
    subscriptions: Vec<Subscription>,
}

/// One board's sync session.
pub struct SyncSession {
    config: SessionConfig,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus<BusPayload>>,
    document: Arc<DocumentAdapter>,
    filesystem: Arc<FilesystemAdapter>,
    manager: Arc<StructureManager>,
    inner: Mutex<SessionInner>,
    self_ref: Weak<SyncSession>,
}

impl SyncSession {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, clock: SharedClock) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(Arc::clone(&clock)));
        let document = DocumentAdapter::new(
            Arc::clone(&clock),
            config.change_debounce_ms,
            config.ack_timeout_ms,
        );
        let filesystem =
            FilesystemAdapter::new(Arc::clone(&clock), Arc::clone(&transport), &config);
        let manager = StructureManager::new(
            Arc::clone(&clock),
            Arc::clone(&document),
            Arc::clone(&filesystem),
            Arc::clone(&bus),
        );

        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(SessionInner {
                breaker: CircuitBreaker::new(config.breaker),
                error: None,
                scheduled_sync: None,
                attached_once: false,
                started: false,
                subscriptions: Vec::new(),
            }),
            config,
            clock,
            transport,
            bus,
            document,
            filesystem,
            manager,
            self_ref: self_ref.clone(),
        })
    }

    /// Wire the session together and join the board.
    ///
    /// A failure here is recorded as the session error and counted by the
    /// breaker. It is never fatal: `reset_sync` and the next reconnect try
    /// again.
    pub fn initialize(&self) {
        let session = self.self_ref.clone();
        let sync_sub = self.manager.subscribe(move |event| {
            if let Some(session) = session.upgrade() {
                session.on_sync_event(event);
            }
        });
        {
            let mut inner = self.lock();
            inner.started = true;
            inner.subscriptions.push(sync_sub);
        }

        self.initialize_manager();

        // Registered after the filesystem adapter so a reconnect rejoins first.
        let session = self.self_ref.clone();
        let transport_sub = self.transport.subscribe(Box::new(move |event| {
            if let Some(session) = session.upgrade() {
                session.on_transport_event(event);
            }
        }));
        self.lock().subscriptions.push(transport_sub);
        info!("Sync session started for board {}", self.config.board_name);
    }

    /// Attach the canvas. The first attach schedules an initial forced sync.
    pub fn set_document_instance(&self, canvas: Arc<dyn CanvasDocument>) {
        self.document.attach(canvas);
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if !inner.attached_once {
            inner.attached_once = true;
            inner.scheduled_sync = Some(now.saturating_add(self.config.initial_sync_delay_ms));
        }
    }

    /// Clear failures and status, then sync once shortly after. A failed
    /// initialization is retried first.
    pub fn reset_sync(&self) {
        let now = self.clock.now_ms();
        {
            let mut inner = self.lock();
            inner.breaker.reset();
            inner.error = None;
            inner.scheduled_sync = Some(now.saturating_add(self.config.reset_sync_delay_ms));
        }
        self.retry_initialize();
        self.manager.reset_status();
        info!("Sync reset for board {}", self.config.board_name);
    }

    pub fn force_sync(&self) {
        self.manager.force_sync();
    }

    /// Drive every timer of the session from the clock.
    pub fn tick(&self) {
        let now = self.clock.now_ms();
        self.document.tick(now);
        self.filesystem.tick(now);
        self.manager.tick(now);

        let (reopened, scheduled) = {
            let mut inner = self.lock();
            let reopened = inner.breaker.take_reopen(now);
            let scheduled = match inner.scheduled_sync {
                Some(at) if now >= at => {
                    inner.scheduled_sync = None;
                    true
                }
                _ => false,
            };
            (reopened, scheduled)
        };

        if reopened {
            if self.transport.is_connected() {
                info!("Resuming sync for board {}", self.config.board_name);
                self.manager.set_active(true);
                self.manager.force_sync();
            } else {
                debug!("Breaker closed while disconnected, waiting for reconnect");
            }
        }
        if scheduled {
            self.manager.force_sync();
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.manager.sync_status()
    }

    pub fn sync_error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().breaker.failures()
    }

    pub fn indicator(&self) -> SyncIndicator {
        if self.lock().error.is_some() {
            SyncIndicator::Error
        } else if self.manager.is_active() {
            SyncIndicator::Active
        } else {
            SyncIndicator::Inactive
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus<BusPayload>> {
        &self.bus
    }

    pub fn document(&self) -> &Arc<DocumentAdapter> {
        &self.document
    }

    pub fn filesystem(&self) -> &Arc<FilesystemAdapter> {
        &self.filesystem
    }

    pub fn manager(&self) -> &Arc<StructureManager> {
        &self.manager
    }

    /// Drop every subscription and deadline.
    pub fn shutdown(&self) {
        let subscriptions = {
            let mut inner = self.lock();
            inner.scheduled_sync = None;
            inner.started = false;
            inner.breaker.reset();
            std::mem::take(&mut inner.subscriptions)
        };
        drop(subscriptions);
        self.manager.shutdown();
        self.filesystem.shutdown();
        self.document.shutdown();
        info!("Sync session for board {} shut down", self.config.board_name);
    }

    fn on_sync_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncFailed { error, timestamp } => {
                let tripped = {
                    let mut inner = self.lock();
                    inner.error = Some(error.clone());
                    inner.breaker.record_failure(*timestamp)
                };
                if let Some(deadline) = tripped {
                    warn!(
                        "Sync for {} paused until {} after {} consecutive failures",
                        self.config.board_name,
                        deadline,
                        self.consecutive_failures()
                    );
                    self.manager.set_active(false);
                }
            }
            SyncEvent::SyncCompleted {
                persisted: true, ..
            } => {
                let mut inner = self.lock();
                inner.breaker.record_success();
                inner.error = None;
            }
            _ => {}
        }
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.lock().breaker.reset();
                self.retry_initialize();
                if self.config.options.auto_sync {
                    self.manager.set_active(true);
                    self.manager.force_sync();
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.manager.set_active(false);
                match reason {
                    DisconnectReason::Unauthorized => {
                        info!("Board hub unavailable for {}: unauthorized", self.config.board_name)
                    }
                    DisconnectReason::Closed => {
                        debug!("Board hub connection closed for {}", self.config.board_name)
                    }
                    DisconnectReason::Error(e) => {
                        warn!("Board hub connection lost for {}: {}", self.config.board_name, e)
                    }
                }
            }
            TransportEvent::Message(_) => {}
        }
    }

    fn initialize_manager(&self) -> bool {
        match self.manager.initialize(self.config.options.clone()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to initialize sync for {}: {}", self.config.board_name, e);
                let now = self.clock.now_ms();
                let mut inner = self.lock();
                inner.error = Some(e.to_string());
                inner.breaker.record_failure(now);
                false
            }
        }
    }

    /// Initialize the manager again if an earlier attempt failed.
    fn retry_initialize(&self) {
        if !self.lock().started || self.manager.state() != SessionState::Uninitialized {
            return;
        }
        info!("Retrying sync initialization for board {}", self.config.board_name);
        if self.initialize_manager() {
            self.lock().error = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
