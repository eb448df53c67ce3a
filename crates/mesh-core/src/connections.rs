//! Connection table: lifecycle state for every socket and the peer records
//! of authenticated ones.
//!
//! The table is the only place a [`PeerRecord`] is created or removed, which
//! keeps the invariants in one spot:
//! - a connection has a peer record only once it reached `Authenticated`
//! - closing a connection removes it and the record it owns, never another
//! - at most one live record exists per peer id (duplicates are resolved on
//!   authentication, see [`check_duplicate_connection`])

use crate::error::ProtocolError;
use crate::protocol::HandshakePayload;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};
use tracing::debug;

/// Locally generated connection identifier ("conn-7").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Socket being established
    Connecting,
    /// Socket open, no handshake exchanged yet
    Handshaking,
    /// Our handshake sent, waiting for theirs
    AwaitingResponse,
    /// Valid handshake received, peer record exists
    Authenticated,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::Handshaking | Self::AwaitingResponse)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub state: ConnectionState,
    /// "host:port" we dialed, or the remote socket address for inbound
    pub remote_address: String,
    /// Set once authenticated
    pub peer_id: Option<String>,
    pub opened_at: u64,
    pub last_message_at: u64,
    /// Whether our own handshake went out on this connection
    pub local_handshake_sent: bool,
}

/// An authenticated peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    pub capabilities: BTreeSet<String>,
    pub protocol_version: String,
    pub connected_at: u64,
}

/// A connection removed from the table, with the record it owned.
#[derive(Debug, Clone)]
pub struct ClosedConnection {
    pub connection: Connection,
    pub peer: Option<PeerRecord>,
}

/// Result of checking a newly authenticated connection against an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheckResult {
    /// No other connection to this peer
    NoDuplicate,
    /// Keep the existing connection, close the new one
    CloseThis,
    /// Keep the new connection, close the existing one
    CloseOther,
}

/// Decide which of two connections to the same peer survives.
///
/// Both ends must reach the same answer without coordinating, so the rule
/// only looks at the two node ids: the connection dialed by the node with the
/// smaller id wins. Two connections in the same direction keep the older one.
pub fn check_duplicate_connection(
    our_id: &str,
    their_id: &str,
    new_direction: Direction,
    existing_direction: Option<Direction>,
) -> DuplicateCheckResult {
    let Some(existing) = existing_direction else {
        return DuplicateCheckResult::NoDuplicate;
    };
    if existing == new_direction {
        return DuplicateCheckResult::CloseThis;
    }

    let preferred = if our_id < their_id {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    if new_direction == preferred {
        DuplicateCheckResult::CloseOther
    } else {
        DuplicateCheckResult::CloseThis
    }
}

/// What the caller must do after a successful authentication.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub record: PeerRecord,
    /// Our handshake hasn't been sent on this connection yet
    pub reply_needed: bool,
    /// An older connection to the same peer that lost the duplicate check;
    /// already removed from the table, its socket must still be closed
    pub superseded: Option<ClosedConnection>,
}

/// Owned table of connections and peer records.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    /// peer id → (record, owning connection)
    peers: HashMap<String, (PeerRecord, ConnectionId)>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register a new connection in the `Connecting` state.
    pub fn open(&mut self, direction: Direction, remote_address: &str, now_ms: u64) -> ConnectionId {
        let id = ConnectionId(self.next_id.max(1));
        self.next_id = id.0 + 1;

        self.connections.insert(
            id,
            Connection {
                connection_id: id,
                direction,
                state: ConnectionState::Connecting,
                remote_address: remote_address.to_string(),
                peer_id: None,
                opened_at: now_ms,
                last_message_at: now_ms,
                local_handshake_sent: false,
            },
        );
        id
    }

    /// Socket established: `Connecting` → `Handshaking`.
    pub fn begin_handshake(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) if conn.state == ConnectionState::Connecting => {
                conn.state = ConnectionState::Handshaking;
                true
            }
            _ => false,
        }
    }

    /// Record that our handshake went out on this connection.
    ///
    /// Returns false if it had already been sent (at most once per connection).
    pub fn mark_handshake_sent(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if conn.local_handshake_sent {
            return false;
        }
        conn.local_handshake_sent = true;
        if conn.state == ConnectionState::Handshaking {
            conn.state = ConnectionState::AwaitingResponse;
        }
        true
    }

    /// Promote a connection to `Authenticated` after a valid handshake.
    ///
    /// The payload must already have passed [`HandshakePayload::validate`].
    /// Fails if the connection is not mid-handshake, or if it loses the
    /// duplicate check against an existing connection to the same peer.
    pub fn authenticate(
        &mut self,
        id: ConnectionId,
        our_id: &str,
        handshake: &HandshakePayload,
        now_ms: u64,
    ) -> Result<Authenticated, ProtocolError> {
        let conn = self
            .connections
            .get(&id)
            .ok_or_else(|| ProtocolError::UnexpectedHandshake(id.to_string()))?;
        if !conn.state.is_handshaking() {
            return Err(ProtocolError::UnexpectedHandshake(id.to_string()));
        }
        let direction = conn.direction;
        let peer_id = handshake.sender_id.clone();

        let existing = self.peers.get(&peer_id).map(|(_, conn_id)| *conn_id);
        let existing_direction = existing
            .and_then(|conn_id| self.connections.get(&conn_id))
            .map(|c| c.direction);

        let superseded =
            match check_duplicate_connection(our_id, &peer_id, direction, existing_direction) {
                DuplicateCheckResult::NoDuplicate => None,
                DuplicateCheckResult::CloseThis => {
                    return Err(ProtocolError::DuplicateConnection(peer_id));
                }
                DuplicateCheckResult::CloseOther => existing.and_then(|old| self.close(old)),
            };

        let record = PeerRecord {
            peer_id: peer_id.clone(),
            capabilities: handshake.capabilities.iter().cloned().collect(),
            protocol_version: handshake.protocol_version.clone(),
            connected_at: now_ms,
        };

        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| ProtocolError::UnexpectedHandshake(id.to_string()))?;
        conn.state = ConnectionState::Authenticated;
        conn.peer_id = Some(peer_id.clone());
        conn.last_message_at = now_ms;
        let reply_needed = !conn.local_handshake_sent;

        self.peers.insert(peer_id.clone(), (record.clone(), id));
        debug!("Authenticated {} as {}", id, peer_id);

        Ok(Authenticated {
            record,
            reply_needed,
            superseded,
        })
    }

    /// Remove a connection and the peer record it owns.
    pub fn close(&mut self, id: ConnectionId) -> Option<ClosedConnection> {
        let mut connection = self.connections.remove(&id)?;
        connection.state = ConnectionState::Closed;

        let peer = match &connection.peer_id {
            Some(pid) if self.peers.get(pid).is_some_and(|(_, owner)| *owner == id) => {
                self.peers.remove(pid).map(|(record, _)| record)
            }
            _ => None,
        };

        Some(ClosedConnection { connection, peer })
    }

    /// Note inbound activity on a connection.
    pub fn touch(&mut self, id: ConnectionId, now_ms: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_message_at = now_ms;
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Peer id of an authenticated connection.
    pub fn peer_for(&self, id: ConnectionId) -> Option<&str> {
        self.connections
            .get(&id)
            .filter(|c| c.state == ConnectionState::Authenticated)
            .and_then(|c| c.peer_id.as_deref())
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id).map(|(record, _)| record)
    }

    pub fn connection_for_peer(&self, peer_id: &str) -> Option<ConnectionId> {
        self.peers.get(peer_id).map(|(_, id)| *id)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Whether any live outbound connection targets `address`.
    pub fn has_outbound_to(&self, address: &str) -> bool {
        self.connections
            .values()
            .any(|c| c.direction == Direction::Outbound && c.remote_address == address)
    }

    /// Ids of all authenticated connections.
    pub fn authenticated(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Authenticated)
            .map(|c| c.connection_id)
            .collect();
        ids.sort();
        ids
    }

    /// Connections still mid-handshake after `timeout_ms`.
    pub fn expired_handshakes(&self, now_ms: u64, timeout_ms: u64) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.state != ConnectionState::Authenticated)
            .filter(|c| now_ms.saturating_sub(c.opened_at) >= timeout_ms)
            .map(|c| c.connection_id)
            .collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().map(|(record, _)| record)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;

    const LOCAL: &str = "bbbb";

    fn handshake(sender: &str) -> HandshakePayload {
        HandshakePayload {
            sender_id: sender.to_string(),
            genesis_proof: String::new(),
            capabilities: vec!["pulse".into(), "discovery".into()],
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn handshaking(table: &mut ConnectionTable, direction: Direction) -> ConnectionId {
        let id = table.open(direction, "10.0.0.1:9001", 0);
        assert!(table.begin_handshake(id));
        id
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_open_starts_connecting() {
        let mut table = ConnectionTable::new();
        let id = table.open(Direction::Inbound, "10.0.0.1:5555", 100);

        let conn = table.get(id).unwrap();
        assert_eq!(conn.state, ConnectionState::Connecting);
        assert!(conn.peer_id.is_none());
        assert_eq!(id.to_string(), "conn-1");
    }

    #[test]
    fn test_ids_are_unique() {
        let mut table = ConnectionTable::new();
        let a = table.open(Direction::Inbound, "x", 0);
        let b = table.open(Direction::Inbound, "x", 0);
        table.close(a);
        let c = table.open(Direction::Inbound, "x", 0);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_handshake_sent_once() {
        let mut table = ConnectionTable::new();
        let id = handshaking(&mut table, Direction::Outbound);

        assert!(table.mark_handshake_sent(id));
        assert_eq!(table.get(id).unwrap().state, ConnectionState::AwaitingResponse);
        assert!(!table.mark_handshake_sent(id));
    }

    #[test]
    fn test_inbound_authentication_needs_reply() {
        let mut table = ConnectionTable::new();
        let id = handshaking(&mut table, Direction::Inbound);

        let auth = table.authenticate(id, LOCAL, &handshake("aaaa"), 50).unwrap();

        assert!(auth.reply_needed);
        assert!(auth.superseded.is_none());
        assert_eq!(auth.record.peer_id, "aaaa");
        assert!(auth.record.capabilities.contains("pulse"));
        assert_eq!(table.get(id).unwrap().state, ConnectionState::Authenticated);
        assert_eq!(table.peer_for(id), Some("aaaa"));
        assert_eq!(table.peer("aaaa").unwrap().connected_at, 50);
    }

    #[test]
    fn test_outbound_authentication_no_reply() {
        let mut table = ConnectionTable::new();
        let id = handshaking(&mut table, Direction::Outbound);
        table.mark_handshake_sent(id);

        let auth = table.authenticate(id, LOCAL, &handshake("aaaa"), 0).unwrap();
        assert!(!auth.reply_needed);
    }

    #[test]
    fn test_no_record_before_authenticated() {
        let mut table = ConnectionTable::new();
        let id = handshaking(&mut table, Direction::Inbound);

        assert!(table.peer_for(id).is_none());
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn test_authenticate_requires_handshake_state() {
        let mut table = ConnectionTable::new();
        let id = table.open(Direction::Inbound, "x", 0);

        // Still connecting
        assert!(table.authenticate(id, LOCAL, &handshake("aaaa"), 0).is_err());

        table.begin_handshake(id);
        table.authenticate(id, LOCAL, &handshake("aaaa"), 0).unwrap();

        // Already authenticated
        assert!(matches!(
            table.authenticate(id, LOCAL, &handshake("aaaa"), 0),
            Err(ProtocolError::UnexpectedHandshake(_))
        ));
    }

    // ==================== Close ====================

    #[test]
    fn test_close_removes_connection_and_record() {
        let mut table = ConnectionTable::new();
        let a = handshaking(&mut table, Direction::Inbound);
        let b = handshaking(&mut table, Direction::Inbound);
        table.authenticate(a, LOCAL, &handshake("aaaa"), 0).unwrap();
        table.authenticate(b, LOCAL, &handshake("cccc"), 0).unwrap();

        let closed = table.close(a).unwrap();

        assert_eq!(closed.connection.state, ConnectionState::Closed);
        assert_eq!(closed.peer.unwrap().peer_id, "aaaa");
        assert_eq!(table.len(), 1);
        assert_eq!(table.peer_count(), 1);
        assert!(!table.is_connected("aaaa"));
        assert!(table.is_connected("cccc"));
        assert!(table.close(a).is_none());
    }

    #[test]
    fn test_close_unauthenticated_has_no_record() {
        let mut table = ConnectionTable::new();
        let id = handshaking(&mut table, Direction::Inbound);

        let closed = table.close(id).unwrap();
        assert!(closed.peer.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_records_always_have_live_connection() {
        let mut table = ConnectionTable::new();
        let ids: Vec<_> = (0..5)
            .map(|_| handshaking(&mut table, Direction::Inbound))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            table
                .authenticate(*id, LOCAL, &handshake(&format!("peer-{}", i)), 0)
                .unwrap();
        }
        table.close(ids[1]);
        table.close(ids[3]);

        for record in table.peers() {
            let conn_id = table.connection_for_peer(&record.peer_id).unwrap();
            assert_eq!(
                table.get(conn_id).unwrap().state,
                ConnectionState::Authenticated
            );
        }
        assert_eq!(table.peer_count(), table.authenticated().len());
    }

    // ==================== Duplicates ====================

    #[test]
    fn test_duplicate_rule_is_symmetric() {
        // "aaaa" < "bbbb": the connection dialed by aaaa survives on both ends
        assert_eq!(
            check_duplicate_connection("aaaa", "bbbb", Direction::Outbound, Some(Direction::Inbound)),
            DuplicateCheckResult::CloseOther
        );
        assert_eq!(
            check_duplicate_connection("aaaa", "bbbb", Direction::Inbound, Some(Direction::Outbound)),
            DuplicateCheckResult::CloseThis
        );
        assert_eq!(
            check_duplicate_connection("bbbb", "aaaa", Direction::Inbound, Some(Direction::Outbound)),
            DuplicateCheckResult::CloseOther
        );
        assert_eq!(
            check_duplicate_connection("bbbb", "aaaa", Direction::Outbound, Some(Direction::Inbound)),
            DuplicateCheckResult::CloseThis
        );
    }

    #[test]
    fn test_duplicate_same_direction_keeps_existing() {
        assert_eq!(
            check_duplicate_connection("aaaa", "bbbb", Direction::Inbound, Some(Direction::Inbound)),
            DuplicateCheckResult::CloseThis
        );
        assert_eq!(
            check_duplicate_connection("aaaa", "bbbb", Direction::Inbound, None),
            DuplicateCheckResult::NoDuplicate
        );
    }

    #[test]
    fn test_duplicate_rejected_keeps_single_record() {
        // Local "bbbb", remote "aaaa": remote's dial (our inbound) is preferred
        let mut table = ConnectionTable::new();
        let inbound = handshaking(&mut table, Direction::Inbound);
        table.authenticate(inbound, LOCAL, &handshake("aaaa"), 0).unwrap();

        let outbound = handshaking(&mut table, Direction::Outbound);
        let result = table.authenticate(outbound, LOCAL, &handshake("aaaa"), 0);

        assert!(matches!(result, Err(ProtocolError::DuplicateConnection(_))));
        assert_eq!(table.peer_count(), 1);
        assert_eq!(table.connection_for_peer("aaaa"), Some(inbound));
    }

    #[test]
    fn test_duplicate_supersedes_existing() {
        // Local "bbbb", remote "cccc": our dial (outbound) is preferred
        let mut table = ConnectionTable::new();
        let inbound = handshaking(&mut table, Direction::Inbound);
        table.authenticate(inbound, LOCAL, &handshake("cccc"), 0).unwrap();

        let outbound = handshaking(&mut table, Direction::Outbound);
        let auth = table.authenticate(outbound, LOCAL, &handshake("cccc"), 10).unwrap();

        let superseded = auth.superseded.unwrap();
        assert_eq!(superseded.connection.connection_id, inbound);
        assert_eq!(superseded.peer.unwrap().peer_id, "cccc");
        assert!(table.get(inbound).is_none());
        assert_eq!(table.peer_count(), 1);
        assert_eq!(table.connection_for_peer("cccc"), Some(outbound));
    }

    // ==================== Sweep ====================

    #[test]
    fn test_expired_handshakes() {
        let mut table = ConnectionTable::new();
        let stuck = table.open(Direction::Inbound, "x", 0);
        table.begin_handshake(stuck);
        let fresh = table.open(Direction::Inbound, "y", 9_000);
        table.begin_handshake(fresh);
        let done = table.open(Direction::Inbound, "z", 0);
        table.begin_handshake(done);
        table.authenticate(done, LOCAL, &handshake("aaaa"), 0).unwrap();

        let expired = table.expired_handshakes(10_000, 10_000);
        assert_eq!(expired, vec![stuck]);
    }

    #[test]
    fn test_has_outbound_to() {
        let mut table = ConnectionTable::new();
        table.open(Direction::Outbound, "10.0.0.9:9001", 0);
        table.open(Direction::Inbound, "10.0.0.8:5000", 0);

        assert!(table.has_outbound_to("10.0.0.9:9001"));
        assert!(!table.has_outbound_to("10.0.0.8:5000"));
    }
}
