//! Events emitted to external consumers.
//!
//! The node delivers these on a channel rather than through registered
//! callbacks; consumers drain the receiving half at their own pace.

use crate::connections::ConnectionId;
use crate::signal::PatternRecord;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A handshake completed and the peer is now authenticated.
    PeerConnected {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// A connection closed. `peer_id` is set if it had authenticated.
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: Option<String>,
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        reason: CloseReason,
    },
    /// The signal analyzer matched a ratio pattern in a peer's history.
    PatternDetected(PatternRecord),
    /// A peer broadcast an alert; passed through untouched.
    AlertReceived {
        #[serde(rename = "peerId")]
        peer_id: String,
        payload: Value,
    },
    /// A peer's pulse payload, for consumers of the state summaries.
    PulseReceived {
        #[serde(rename = "peerId")]
        peer_id: String,
        payload: Value,
    },
    /// The node finished shutting down; no further events follow.
    ShutdownComplete,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    /// Remote end closed the socket
    RemoteClosed,
    /// Read, write or socket error
    NetworkError,
    /// Invalid handshake or protocol violation
    ProtocolError,
    /// Handshake not completed in time
    HandshakeTimeout,
    /// Another connection to the same peer was kept instead
    Duplicate,
    /// Peer announced it is shutting down
    RemoteShutdown,
    /// This node is shutting down
    LocalShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = MeshEvent::PeerConnected {
            peer_id: "abc".into(),
            connection_id: ConnectionId::new(3),
        };
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"type\":\"peer_connected\""));
        assert!(json.contains("\"peerId\":\"abc\""));
        assert!(json.contains("\"connectionId\":\"conn-3\""));
    }

    #[test]
    fn test_disconnect_reason_serialization() {
        let event = MeshEvent::PeerDisconnected {
            peer_id: None,
            connection_id: ConnectionId::new(1),
            reason: CloseReason::HandshakeTimeout,
        };
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"reason\":\"handshakeTimeout\""));
        assert!(json.contains("\"peerId\":null"));
    }
}
