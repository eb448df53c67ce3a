//! Message kinds and their typed payloads.
//!
//! Every frame carries exactly one [`Message`]. Known kinds decode into a
//! typed payload; anything else becomes [`Message::Unknown`] so newer peers
//! can introduce message kinds without breaking older ones.

use super::handshake::HandshakePayload;
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HANDSHAKE: &str = "handshake";
pub const PULSE: &str = "pulse";
pub const PATTERN_BROADCAST: &str = "pattern_broadcast";
pub const ALERT: &str = "alert";
pub const DISCOVERY: &str = "discovery";
pub const SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakePayload),
    Pulse(PulsePayload),
    PatternBroadcast(PatternBroadcastPayload),
    Alert(AlertPayload),
    Discovery(DiscoveryPayload),
    Shutdown(ShutdownPayload),
    /// A kind this node doesn't know about; the payload is discarded.
    Unknown { kind: String },
}

/// State summary from the sender's state-summary provider.
///
/// Opaque except for one designated numeric field read as the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PulsePayload(pub Value);

impl PulsePayload {
    /// Read `field` as a finite number, if present.
    pub fn signal(&self, field: &str) -> Option<f64> {
        self.0.get(field)?.as_f64().filter(|v| v.is_finite())
    }
}

/// Pattern summary a node shares about its own signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPattern {
    pub ratio: f64,
    pub base_value: f64,
    pub strength: f64,
}

/// Sent on every synchronization round.
///
/// Receivers fold `signal` into the sender's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternBroadcastPayload {
    pub signal: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<SharedPattern>,
}

/// Alert payload, passed straight through to external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertPayload(pub Value);

/// A peer address being advertised to the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub address: String,
    pub port: u16,
}

impl DiscoveryPayload {
    /// Split a "host:port" string into a discovery payload.
    pub fn from_socket_address(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            address: host.to_string(),
            port: port.parse().ok()?,
        })
    }

    /// The "host:port" form stored in the peer directory.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Notice that the sender is leaving the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Message {
    /// The wire `type` string for this message.
    pub fn kind(&self) -> &str {
        match self {
            Message::Handshake(_) => HANDSHAKE,
            Message::Pulse(_) => PULSE,
            Message::PatternBroadcast(_) => PATTERN_BROADCAST,
            Message::Alert(_) => ALERT,
            Message::Discovery(_) => DISCOVERY,
            Message::Shutdown(_) => SHUTDOWN,
            Message::Unknown { kind } => kind,
        }
    }

    /// Serialize the payload half of the envelope.
    pub fn payload(&self) -> Value {
        let value = match self {
            Message::Handshake(p) => serde_json::to_value(p),
            Message::Pulse(p) => Ok(p.0.clone()),
            Message::PatternBroadcast(p) => serde_json::to_value(p),
            Message::Alert(p) => Ok(p.0.clone()),
            Message::Discovery(p) => serde_json::to_value(p),
            Message::Shutdown(p) => serde_json::to_value(p),
            Message::Unknown { .. } => Ok(Value::Null),
        };
        value.expect("Message payload serialization should not fail")
    }

    /// Decode a payload given its wire `type`.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, ProtocolError> {
        Ok(match kind {
            HANDSHAKE => Message::Handshake(decode_payload(kind, payload)?),
            PULSE => Message::Pulse(PulsePayload(payload)),
            PATTERN_BROADCAST => Message::PatternBroadcast(decode_payload(kind, payload)?),
            ALERT => Message::Alert(AlertPayload(payload)),
            DISCOVERY => Message::Discovery(decode_payload(kind, payload)?),
            SHUTDOWN if payload.is_null() => Message::Shutdown(ShutdownPayload::default()),
            SHUTDOWN => Message::Shutdown(decode_payload(kind, payload)?),
            other => Message::Unknown {
                kind: other.to_string(),
            },
        })
    }
}

fn decode_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
