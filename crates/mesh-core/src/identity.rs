//! NodeIdentity: the stable identity a node advertises to its peers.
//!
//! Generated once on first run and persisted through a [`Store`]; every
//! later run loads the same identity back unchanged.
//!
//! The genesis proof binds the id to its birth time and a random nonce. It is
//! a sanity check only and is never used as cryptographic authentication.

use crate::error::StorageError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// Length of the hex node id.
pub const NODE_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    /// Stable opaque id derived from host characteristics and randomness
    pub id: String,
    /// When this identity was created
    pub birth_time: DateTime<Utc>,
    /// sha256(id ‖ birth time ‖ signal state ‖ nonce), hex encoded
    pub genesis_proof: String,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    ///
    /// `signal_state` is a short description of the signal system at birth,
    /// folded into the genesis proof.
    pub fn generate(signal_state: &str) -> Self {
        let birth_time = Utc::now();

        let host_entropy: [u8; 32] = rand::random();
        let mut hasher = Sha256::new();
        hasher.update(hostname().as_bytes());
        hasher.update(std::env::consts::OS.as_bytes());
        hasher.update(std::env::consts::ARCH.as_bytes());
        hasher.update(host_entropy);
        let id = hex::encode(hasher.finalize())[..NODE_ID_LEN].to_string();

        let nonce: [u8; 16] = rand::random();
        let genesis_proof = genesis_proof(&id, &birth_time, signal_state, &nonce);

        Self {
            id,
            birth_time,
            genesis_proof,
        }
    }

    /// Check that the genesis proof looks like a sha256 hex digest.
    pub fn verify_proof_shape(&self) -> bool {
        self.genesis_proof.len() == 64 && self.genesis_proof.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Serialize to pretty JSON bytes for the store.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("NodeIdentity serialization should not fail")
    }
}

fn genesis_proof(id: &str, birth_time: &DateTime<Utc>, signal_state: &str, nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(birth_time.timestamp_millis().to_be_bytes());
    hasher.update(signal_state.as_bytes());
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

/// Hostname from `$HOSTNAME`, then `/etc/hostname`, else "localhost".
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Load the identity stored at `path`, generating and persisting one on first run.
///
/// A stored identity that fails to parse is reported as corrupt and left in place.
pub fn get_or_create_identity(
    store: &dyn Store,
    path: &Path,
    signal_state: &str,
) -> Result<NodeIdentity, StorageError> {
    if let Some(bytes) = store.load(path)? {
        let identity: NodeIdentity =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        info!("Loaded node identity {}", identity.id);
        return Ok(identity);
    }

    let identity = NodeIdentity::generate(signal_state);
    store.save(path, &identity.to_json())?;
    info!("Generated new node identity {}", identity.id);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use tempfile::TempDir;

    #[test]
    fn test_generate_shape() {
        let identity = NodeIdentity::generate("signal:0");

        assert_eq!(identity.id.len(), NODE_ID_LEN);
        assert!(identity.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(identity.verify_proof_shape());
    }

    #[test]
    fn test_hostname_is_trimmed_and_non_empty() {
        let name = hostname();
        assert!(!name.is_empty());
        assert_eq!(name, name.trim());
    }

    #[test]
    fn test_generate_is_unique() {
        let a = NodeIdentity::generate("signal:0");
        let b = NodeIdentity::generate("signal:0");
        assert_ne!(a.id, b.id);
        assert_ne!(a.genesis_proof, b.genesis_proof);
    }

    #[test]
    fn test_first_run_persists() {
        let store = MemoryStore::new();
        let path = Path::new("identity.json");

        let identity = get_or_create_identity(&store, path, "signal:0").unwrap();

        assert!(store.contains(path));
        let stored: NodeIdentity =
            serde_json::from_slice(&store.load(path).unwrap().unwrap()).unwrap();
        assert_eq!(stored, identity);
    }

    #[test]
    fn test_second_run_loads_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path());
        let path = Path::new("identity.json");

        let first = get_or_create_identity(&store, path, "signal:0").unwrap();
        let second = get_or_create_identity(&store, path, "signal:7").unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let identity = NodeIdentity::generate("signal:0");
        let json = String::from_utf8(identity.to_json()).unwrap();

        assert!(json.contains("\"birthTime\""));
        assert!(json.contains("\"genesisProof\""));
    }

    #[test]
    fn test_unwritable_path_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("blocker"), b"x").unwrap();
        let store = FileStore::new(temp_dir.path());

        let result = get_or_create_identity(&store, Path::new("blocker/identity.json"), "signal:0");
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }

    #[test]
    fn test_corrupt_identity_is_not_replaced() {
        let store = MemoryStore::new();
        let path = Path::new("identity.json");
        store.save(path, b"not json").unwrap();

        let result = get_or_create_identity(&store, path, "signal:0");

        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
        assert_eq!(store.load(path).unwrap(), Some(b"not json".to_vec()));
    }
}
