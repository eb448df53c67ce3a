//! Error taxonomy for the mesh.
//!
//! - `StorageError`: identity / peer directory persistence. Fatal at startup,
//!   logged and retried at runtime.
//! - `ConnectionError`: socket-level failure. Tears down one connection.
//! - `ProtocolError`: malformed, stale or invalid messages and failed
//!   handshakes (including handshake timeouts). Drops the message or closes
//!   the offending connection.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt data at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Store is read-only: {0}")]
    ReadOnly(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection refused by {address}: {reason}")]
    Refused { address: String, reason: String },
    #[error("Connection limit reached")]
    AtCapacity,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Stale message: timestamp {timestamp} is more than {max_skew_ms}ms before {now}")]
    Stale {
        timestamp: u64,
        now: u64,
        max_skew_ms: u64,
    },
    #[error("Future message: timestamp {timestamp} is more than {max_skew_ms}ms after {now}")]
    Future {
        timestamp: u64,
        now: u64,
        max_skew_ms: u64,
    },
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("Handshake sender ID cannot be empty")]
    EmptySenderId,
    #[error("Handshake sender {payload} does not match envelope sender {envelope}")]
    SenderMismatch { envelope: String, payload: String },
    #[error("Refusing handshake from our own node ID")]
    SelfConnection,
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Connection {0} is not in a handshake state")]
    UnexpectedHandshake(String),
    #[error("Duplicate connection to {0}")]
    DuplicateConnection(String),
}
