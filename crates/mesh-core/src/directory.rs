//! Peer directory: persisted list of known peer addresses.
//!
//! Stores peer addresses so the node can dial them again after a restart.
//! Entries are keyed by their "host:port" address and saved as
//! `known_peers.json` through the node's [`Store`]. The number of entries is
//! capped so gossip can't grow the file without bound.

use crate::error::StorageError;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted peer information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    /// Dialable "host:port"
    pub address: String,
    /// Node id last seen at this address
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Last time we were connected (unix timestamp ms)
    #[serde(default)]
    pub last_seen: Option<u64>,
    /// Peer ID of who told us about this address (for debugging)
    #[serde(default)]
    pub discovered_via: Option<String>,
}

impl KnownPeer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peer_id: None,
            last_seen: None,
            discovered_via: None,
        }
    }
}

/// Collection of known peers, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnownPeers {
    pub peers: Vec<KnownPeer>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    /// Add or update a peer.
    pub fn upsert(&mut self, peer: KnownPeer) {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.address == peer.address) {
            if peer.peer_id.is_some() {
                existing.peer_id = peer.peer_id;
            }
            if peer.last_seen.is_some() {
                existing.last_seen = peer.last_seen;
            }
            if peer.discovered_via.is_some() {
                existing.discovered_via = peer.discovered_via;
            }
        } else {
            self.peers.push(peer);
        }
    }

    /// Remove a peer by address.
    pub fn remove(&mut self, address: &str) {
        self.peers.retain(|p| p.address != address);
    }

    pub fn get(&self, address: &str) -> Option<&KnownPeer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }
}

/// Peer directory backed by a store.
///
/// Mutations only mark the directory dirty; the owner decides when to
/// `save`, and a failed save leaves it dirty so the next attempt retries.
pub struct PeerDirectory {
    store: Arc<dyn Store>,
    path: PathBuf,
    peers: KnownPeers,
    capacity: usize,
    dirty: bool,
}

impl PeerDirectory {
    /// Load the directory stored at `path`, or start empty if none exists.
    pub fn load(store: Arc<dyn Store>, path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let peers = match store.load(&path)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
            }
            None => KnownPeers::new(),
        };
        debug!("Loaded {} known peer(s) from {:?}", peers.peers.len(), path);

        Ok(Self {
            store,
            path,
            peers,
            capacity: usize::MAX,
            dirty: false,
        })
    }

    /// Limit how many addresses [`add_address`](Self::add_address) will hold.
    ///
    /// Entries loaded from disk beyond the limit are kept.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an address if it isn't known yet and there is room.
    ///
    /// Returns true if the address was added.
    pub fn add_address(&mut self, address: &str, discovered_via: Option<&str>) -> bool {
        if self.peers.contains(address) {
            return false;
        }
        if self.peers.peers.len() >= self.capacity {
            warn!(
                "Peer directory full ({} entries), ignoring {}",
                self.capacity, address
            );
            return false;
        }
        self.peers.upsert(KnownPeer {
            discovered_via: discovered_via.map(str::to_string),
            ..KnownPeer::new(address)
        });
        self.dirty = true;
        true
    }

    /// Record a successful connection to `address`.
    pub fn record_connected(&mut self, address: &str, peer_id: &str, now_ms: u64) {
        self.peers.upsert(KnownPeer {
            peer_id: Some(peer_id.to_string()),
            last_seen: Some(now_ms),
            ..KnownPeer::new(address)
        });
        self.dirty = true;
    }

    /// Forget an address. Returns true if it was known.
    pub fn remove(&mut self, address: &str) -> bool {
        if !self.peers.contains(address) {
            return false;
        }
        self.peers.remove(address);
        self.dirty = true;
        true
    }

    pub fn get(&self, address: &str) -> Option<&KnownPeer> {
        self.peers.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains(address)
    }

    /// All known addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.peers.peers.iter().map(|p| p.address.as_str())
    }

    pub fn all(&self) -> &[KnownPeer] {
        &self.peers.peers
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the directory to the store.
    pub fn save(&mut self) -> Result<(), StorageError> {
        let contents = serde_json::to_vec_pretty(&self.peers)
            .expect("KnownPeers serialization should not fail");
        self.store.save(&self.path, &contents)?;
        self.dirty = false;
        Ok(())
    }

    /// Save only if something changed since the last successful save.
    pub fn save_if_dirty(&mut self) -> Result<bool, StorageError> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }
}
