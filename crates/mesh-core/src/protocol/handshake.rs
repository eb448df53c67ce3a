//! Versioned handshake payload.
//!
//! The handshake is the first message on every connection. It carries:
//! - The sender's node id
//! - The sender's genesis proof (advisory, only ever logged)
//! - The capabilities the sender supports
//! - The protocol version, of which only the major part must match

use crate::error::ProtocolError;
use crate::identity::NodeIdentity;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Bump the major part for breaking changes; peers with a different major
/// version are refused.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub sender_id: String,
    #[serde(default)]
    pub genesis_proof: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub protocol_version: String,
}

impl HandshakePayload {
    /// Build our own handshake from the local identity.
    pub fn new(identity: &NodeIdentity, capabilities: &[String]) -> Self {
        Self {
            sender_id: identity.id.clone(),
            genesis_proof: identity.genesis_proof.clone(),
            capabilities: capabilities.to_vec(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Validate a handshake received on a connection.
    ///
    /// `envelope_sender` is the `senderId` of the envelope carrying this
    /// payload and `local_id` is our own node id.
    pub fn validate(&self, envelope_sender: &str, local_id: &str) -> Result<(), ProtocolError> {
        if self.sender_id.is_empty() {
            return Err(ProtocolError::EmptySenderId);
        }
        if self.sender_id != envelope_sender {
            return Err(ProtocolError::SenderMismatch {
                envelope: envelope_sender.to_string(),
                payload: self.sender_id.clone(),
            });
        }
        if self.sender_id == local_id {
            return Err(ProtocolError::SelfConnection);
        }
        if !is_supported_version(&self.protocol_version) {
            return Err(ProtocolError::UnsupportedVersion(
                self.protocol_version.clone(),
            ));
        }
        Ok(())
    }

    /// Check if this peer's minor version differs from ours (worth a log line).
    pub fn should_warn_version(&self) -> bool {
        self.protocol_version != PROTOCOL_VERSION
    }
}

/// Major component of a dotted version string ("1.4" → 1).
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Check whether a peer's protocol version can talk to ours.
pub fn is_supported_version(version: &str) -> bool {
    match (major_version(version), major_version(PROTOCOL_VERSION)) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(sender: &str, version: &str) -> HandshakePayload {
        HandshakePayload {
            sender_id: sender.to_string(),
            genesis_proof: "ab".repeat(32),
            capabilities: vec!["pulse".into(), "discovery".into()],
            protocol_version: version.to_string(),
        }
    }

    // ==================== Version compatibility ====================

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("1.0"), Some(1));
        assert_eq!(major_version("2"), Some(2));
        assert_eq!(major_version("12.3.4"), Some(12));
        assert_eq!(major_version("x.1"), None);
        assert_eq!(major_version(""), None);
    }

    #[test]
    fn test_same_major_is_supported() {
        assert!(is_supported_version("1.0"));
        assert!(is_supported_version("1.7"));
        assert!(!is_supported_version("2.0"));
        assert!(!is_supported_version("garbage"));
    }

    #[test]
    fn test_minor_difference_warns() {
        assert!(!payload("a", "1.0").should_warn_version());
        assert!(payload("a", "1.3").should_warn_version());
    }

    // ==================== Validation ====================

    #[test]
    fn test_valid_handshake() {
        assert_eq!(payload("remote", "1.0").validate("remote", "local"), Ok(()));
    }

    #[test]
    fn test_empty_sender_rejected() {
        assert_eq!(
            payload("", "1.0").validate("", "local"),
            Err(ProtocolError::EmptySenderId)
        );
    }

    #[test]
    fn test_sender_mismatch_rejected() {
        assert!(matches!(
            payload("remote", "1.0").validate("someone-else", "local"),
            Err(ProtocolError::SenderMismatch { .. })
        ));
    }

    #[test]
    fn test_self_connection_rejected() {
        assert_eq!(
            payload("local", "1.0").validate("local", "local"),
            Err(ProtocolError::SelfConnection)
        );
    }

    #[test]
    fn test_unsupported_major_rejected() {
        assert_eq!(
            payload("remote", "2.0").validate("remote", "local"),
            Err(ProtocolError::UnsupportedVersion("2.0".into()))
        );
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&payload("remote", "1.0")).unwrap();

        assert!(json.contains("\"senderId\":\"remote\""));
        assert!(json.contains("\"genesisProof\""));
        assert!(json.contains("\"capabilities\":[\"pulse\",\"discovery\"]"));
        assert!(json.contains("\"protocolVersion\":\"1.0\""));
    }

    #[test]
    fn test_from_identity() {
        let identity = NodeIdentity::generate("signal:0");
        let hs = HandshakePayload::new(&identity, &["pulse".to_string()]);

        assert_eq!(hs.sender_id, identity.id);
        assert_eq!(hs.genesis_proof, identity.genesis_proof);
        assert_eq!(hs.protocol_version, PROTOCOL_VERSION);
    }
}
