//! board-server: Hub daemon for collaborative file boards.
//!
//! Stores each board as a folder of files plus a `board.json` snapshot,
//! relays changes between the sessions connected to a board, and watches the
//! storage root for external edits. Also provides `RemoteTransport`, the
//! native WebSocket client the `board-sync` core uses outside a browser.

pub mod client;
pub mod config;
pub mod connection;
pub mod fs;
pub mod hash;
pub mod hub;
pub mod message;
pub mod native_fs;
pub mod server;
pub mod store;
pub mod watcher;

// Re-export key types for convenience
pub use client::{ClientOptions, ReconnectConfig, RemoteTransport};
pub use config::{ClientConfig, Config};
pub use connection::{ConnectionEvent, SessionConnection};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use hash::{ContentHash, FileHashes};
pub use hub::Hub;
pub use message::{Frame, HandshakeMessage, HandshakeRejected, MAX_MESSAGE_SIZE};
pub use native_fs::NativeFs;
pub use server::{ServerEvent, WebSocketServer};
pub use store::{Audience, BoardStore, FrameEntry, Outbound, StoreError};
pub use watcher::{FileEvent, FileWatcher};
