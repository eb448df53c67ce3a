//! mesh-core: Sans-IO logic for the pulse mesh.
//!
//! This crate provides the core functionality for:
//! - Stable node identity (generation and persistence)
//! - The wire envelope, message kinds and handshake validation
//! - Connection state tracking and peer records
//! - Per-peer signal history and ratio pattern detection
//! - The persisted peer directory
//!
//! Sockets, timers and tasks live in `mesh-node`.

pub mod config;
pub mod connections;
pub mod directory;
pub mod error;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod provider;
pub mod signal;
pub mod store;

pub use config::{MeshConfig, SignalConfig};
pub use connections::{
    ClosedConnection, Connection, ConnectionId, ConnectionState, ConnectionTable, Direction,
    PeerRecord,
};
pub use directory::{KnownPeer, PeerDirectory};
pub use error::{ConnectionError, ProtocolError, StorageError};
pub use events::{CloseReason, MeshEvent};
pub use identity::{get_or_create_identity, NodeIdentity};
pub use protocol::{Envelope, HandshakePayload, Message, PROTOCOL_VERSION};
pub use provider::StateProvider;
pub use signal::{PatternRecord, SignalAnalyzer};
pub use store::{FileStore, MemoryStore, Store};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
