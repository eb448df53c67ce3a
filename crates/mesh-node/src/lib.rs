//! mesh-node library: the networked side of the pulse mesh.
//!
//! Wraps the sans-IO state from `mesh-core` in a single actor task that owns
//! the WebSocket listener, outbound dials and per-connection I/O tasks.
//! Exposed as a library so integration tests can drive real nodes.

pub mod broadcast;
pub mod connection;
pub mod dialer;
pub mod listener;
pub mod manager;
pub mod node;

// Re-export key types for convenience
pub use broadcast::{BroadcastReport, ConnectionSink};
pub use connection::{ConnectionEvent, PeerConnection};
pub use dialer::{BackoffConfig, Dialer};
pub use listener::{CLIENT_HEADER, CLIENT_TYPE};
pub use manager::ConnectionManager;
pub use node::{IDENTITY_FILE, KNOWN_PEERS_FILE, Node, NodeHandle, NodeSnapshot};
