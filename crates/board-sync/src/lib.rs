//! board-sync: State synchronization core for collaborative file boards.
//!
//! This crate keeps three independently mutable things consistent:
//! - The canvas document (via `DocumentAdapter` over a `CanvasDocument`)
//! - The remote board store (via `FilesystemAdapter` over a `Transport`)
//! - Every other client session connected to the same board
//!
//! Nothing in here spawns threads or timers. Components keep deadlines and the
//! host drives them by calling `SyncSession::tick()` with an injected `Clock`.

pub mod canvas;
pub mod clock;
pub mod debounce;
pub mod document;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod guard;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod session;
pub mod transport;

pub use canvas::{CanvasDocument, CanvasError, ChangeHook, InMemoryCanvas};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use document::{DocumentAdapter, DocumentEvent};
pub use error::AdapterError;
pub use events::{Emitter, Envelope, EventBus, Subscription};
pub use filesystem::{file_link, resolve_link, FileSystemEvent, FilesystemAdapter};
pub use guard::{AckGuard, GuardToken};
pub use manager::{
    BusPayload, ConflictResolution, SessionState, StructureManager, SyncConflict, SyncEvent,
    SyncOptions, SyncStatus,
};
pub use model::{BoardSnapshot, CanvasElement, Element, ElementKind, FileKind, Structure};
pub use protocol::{BoardMessage, ProtocolError};
pub use session::{BreakerConfig, CircuitBreaker, SessionConfig, SyncIndicator, SyncSession};
pub use transport::{DisconnectReason, MemoryTransport, Transport, TransportError, TransportEvent};
