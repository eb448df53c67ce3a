//! Wire envelope wrapped around every message.
//!
//! Wire format: `{"type":"pulse","senderId":"…","timestamp":1700000000000,"payload":{…}}`
//!
//! Decoding validates in a fixed order: the frame must be JSON, the three
//! header fields must be present, the timestamp must be within the allowed
//! clock skew, and only then is the payload decoded for its kind.

use super::message::Message;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender_id: String,
    /// Milliseconds since the Unix epoch, as stamped by the sender
    pub timestamp: u64,
    pub message: Message,
}

/// Loose shape used for decoding, so missing fields are reported by name.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    sender_id: Option<String>,
    timestamp: Option<u64>,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    sender_id: &'a str,
    timestamp: u64,
    payload: Value,
}

impl Envelope {
    /// Wrap a message stamped with the current time.
    pub fn new(sender_id: impl Into<String>, message: Message) -> Self {
        Self::with_timestamp(sender_id, crate::now_ms(), message)
    }

    pub fn with_timestamp(sender_id: impl Into<String>, timestamp: u64, message: Message) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp,
            message,
        }
    }

    /// The wire `type` of the carried message.
    pub fn kind(&self) -> &str {
        self.message.kind()
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        let wire = WireEnvelope {
            kind: self.message.kind(),
            sender_id: &self.sender_id,
            timestamp: self.timestamp,
            payload: self.message.payload(),
        };
        serde_json::to_vec(&wire).expect("Envelope serialization should not fail")
    }

    /// The `type` a frame declares, without validating anything else.
    pub fn peek_kind(data: &[u8]) -> Option<String> {
        serde_json::from_slice::<RawEnvelope>(data).ok()?.kind
    }

    /// Decode and validate a frame received at `now_ms`.
    pub fn decode(data: &[u8], now_ms: u64, max_skew_ms: u64) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = raw
            .kind
            .filter(|k| !k.is_empty())
            .ok_or(ProtocolError::MissingField("type"))?;
        let sender_id = raw
            .sender_id
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingField("senderId"))?;
        let timestamp = raw.timestamp.ok_or(ProtocolError::MissingField("timestamp"))?;

        if now_ms.saturating_sub(timestamp) > max_skew_ms {
            return Err(ProtocolError::Stale {
                timestamp,
                now: now_ms,
                max_skew_ms,
            });
        }
        if timestamp.saturating_sub(now_ms) > max_skew_ms {
            return Err(ProtocolError::Future {
                timestamp,
                now: now_ms,
                max_skew_ms,
            });
        }

        let message = Message::from_parts(&kind, raw.payload)?;

        Ok(Self {
            sender_id,
            timestamp,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{DiscoveryPayload, PulsePayload};
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;
    const SKEW: u64 = 5 * 60 * 1000;

    fn frame(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_pulse_roundtrip() {
        let env = Envelope::with_timestamp(
            "node-a",
            NOW,
            Message::Pulse(PulsePayload(json!({"signal": 42}))),
        );

        let parsed = Envelope::decode(&env.to_json(), NOW, SKEW).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_wire_format() {
        let env = Envelope::with_timestamp(
            "node-a",
            NOW,
            Message::Discovery(DiscoveryPayload {
                address: "10.0.0.2".into(),
                port: 9001,
            }),
        );
        let json = String::from_utf8(env.to_json()).unwrap();

        assert!(json.contains("\"type\":\"discovery\""));
        assert!(json.contains("\"senderId\":\"node-a\""));
        assert!(json.contains(&format!("\"timestamp\":{}", NOW)));
        assert!(json.contains("\"payload\":{"));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            Envelope::decode(b"not json", NOW, SKEW),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(b"", NOW, SKEW),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let no_type = frame(json!({"senderId": "a", "timestamp": NOW}));
        let no_sender = frame(json!({"type": "pulse", "timestamp": NOW}));
        let empty_sender = frame(json!({"type": "pulse", "senderId": "", "timestamp": NOW}));
        let no_timestamp = frame(json!({"type": "pulse", "senderId": "a"}));

        assert_eq!(
            Envelope::decode(&no_type, NOW, SKEW),
            Err(ProtocolError::MissingField("type"))
        );
        assert_eq!(
            Envelope::decode(&no_sender, NOW, SKEW),
            Err(ProtocolError::MissingField("senderId"))
        );
        assert_eq!(
            Envelope::decode(&empty_sender, NOW, SKEW),
            Err(ProtocolError::MissingField("senderId"))
        );
        assert_eq!(
            Envelope::decode(&no_timestamp, NOW, SKEW),
            Err(ProtocolError::MissingField("timestamp"))
        );
    }

    #[test]
    fn test_peek_kind_of_invalid_frame() {
        let empty_sender = frame(json!({"type": "handshake", "senderId": "", "timestamp": NOW}));

        assert!(Envelope::decode(&empty_sender, NOW, SKEW).is_err());
        assert_eq!(Envelope::peek_kind(&empty_sender).as_deref(), Some("handshake"));
        assert_eq!(Envelope::peek_kind(&frame(json!({"senderId": "a"}))), None);
        assert_eq!(Envelope::peek_kind(b"not json"), None);
    }

    #[test]
    fn test_stale_message_rejected() {
        let old = frame(json!({"type": "pulse", "senderId": "a", "timestamp": NOW - SKEW - 1}));
        assert!(matches!(
            Envelope::decode(&old, NOW, SKEW),
            Err(ProtocolError::Stale { .. })
        ));
    }

    #[test]
    fn test_future_message_rejected() {
        let future = frame(json!({"type": "pulse", "senderId": "a", "timestamp": NOW + SKEW + 1}));
        assert!(matches!(
            Envelope::decode(&future, NOW, SKEW),
            Err(ProtocolError::Future { .. })
        ));
    }

    #[test]
    fn test_skew_boundary_accepted() {
        let edge_old = frame(json!({"type": "pulse", "senderId": "a", "timestamp": NOW - SKEW}));
        let edge_new = frame(json!({"type": "pulse", "senderId": "a", "timestamp": NOW + SKEW}));

        assert!(Envelope::decode(&edge_old, NOW, SKEW).is_ok());
        assert!(Envelope::decode(&edge_new, NOW, SKEW).is_ok());
    }

    #[test]
    fn test_stale_checked_before_payload() {
        // An invalid handshake payload on a stale frame reports staleness
        let stale_bad =
            frame(json!({"type": "handshake", "senderId": "a", "timestamp": 0, "payload": 7}));
        assert!(matches!(
            Envelope::decode(&stale_bad, NOW, SKEW),
            Err(ProtocolError::Stale { .. })
        ));
    }

    #[test]
    fn test_missing_payload_is_null_pulse() {
        let bare = frame(json!({"type": "pulse", "senderId": "a", "timestamp": NOW}));
        let env = Envelope::decode(&bare, NOW, SKEW).unwrap();

        assert_eq!(env.message, Message::Pulse(PulsePayload(Value::Null)));
    }

    #[test]
    fn test_unknown_type_decodes() {
        let unknown = frame(json!({"type": "telemetry", "senderId": "a", "timestamp": NOW}));
        let env = Envelope::decode(&unknown, NOW, SKEW).unwrap();

        assert_eq!(env.kind(), "telemetry");
        assert!(matches!(env.message, Message::Unknown { .. }));
    }
}
