//! Protocol definitions for the pulse mesh.
//!
//! This module defines the wire protocol for peer communication:
//! - The JSON envelope every frame is wrapped in, with its validation rules
//! - The closed set of message kinds and their typed payloads
//! - The handshake payload and version compatibility rules

pub mod envelope;
pub mod handshake;
pub mod message;

pub use envelope::Envelope;
pub use handshake::{HandshakePayload, PROTOCOL_VERSION, is_supported_version};
pub use message::{
    AlertPayload, DiscoveryPayload, Message, PatternBroadcastPayload, PulsePayload,
    SharedPattern, ShutdownPayload,
};

/// Maximum frame size (1MB). Larger frames are dropped unread.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
