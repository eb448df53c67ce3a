//! Connection manager: the connection table plus the sockets behind it.
//!
//! Every table mutation that affects a socket goes through here, so a
//! connection removed from the table always has its socket closed and vice
//! versa.
//!
//! Connection slots are semaphore permits. A permit is taken before a socket
//! exists (an admitted upgrade or a started dial) and is held by the
//! connection until it closes.

use crate::broadcast::{self, BroadcastReport, ConnectionSink};
use crate::connection::PeerConnection;
use mesh_core::connections::Authenticated;
use mesh_core::{
    ClosedConnection, ConnectionError, ConnectionId, ConnectionTable, Direction, Envelope,
    HandshakePayload, ProtocolError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Unified connection manager for inbound and outbound connections.
pub struct ConnectionManager<S = PeerConnection> {
    /// Our node ID (for duplicate resolution)
    local_id: String,
    table: ConnectionTable,
    sinks: HashMap<ConnectionId, S>,
    /// One permit per connection slot
    slots: Arc<Semaphore>,
    permits: HashMap<ConnectionId, OwnedSemaphorePermit>,
}

impl<S: ConnectionSink> ConnectionManager<S> {
    pub fn new(local_id: impl Into<String>, max_connections: usize) -> Self {
        Self {
            local_id: local_id.into(),
            table: ConnectionTable::new(),
            sinks: HashMap::new(),
            slots: Arc::new(Semaphore::new(max_connections)),
            permits: HashMap::new(),
        }
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Shared slot pool, for upgrades that acquire their permit off the actor.
    pub fn slots(&self) -> Arc<Semaphore> {
        self.slots.clone()
    }

    /// Take a free slot, if any.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Register an established socket and move it straight to handshaking.
    ///
    /// `permit` is the slot reserved for this socket; it is released when
    /// the connection closes. `spawn` receives the new connection's ID and
    /// starts its I/O.
    pub fn register(
        &mut self,
        direction: Direction,
        remote_address: &str,
        now_ms: u64,
        permit: OwnedSemaphorePermit,
        spawn: impl FnOnce(ConnectionId) -> S,
    ) -> ConnectionId {
        let id = self.table.open(direction, remote_address, now_ms);
        self.table.begin_handshake(id);
        self.sinks.insert(id, spawn(id));
        self.permits.insert(id, permit);
        info!(
            "New {:?} connection {} ({})",
            direction, id, remote_address
        );
        id
    }

    /// Record that our handshake is going out on `id`. False if already sent.
    pub fn mark_handshake_sent(&mut self, id: ConnectionId) -> bool {
        self.table.mark_handshake_sent(id)
    }

    pub fn touch(&mut self, id: ConnectionId, now_ms: u64) {
        self.table.touch(id, now_ms);
    }

    /// Authenticate `id`, closing the socket of any connection it supersedes.
    pub async fn authenticate(
        &mut self,
        id: ConnectionId,
        handshake: &HandshakePayload,
        now_ms: u64,
    ) -> Result<Authenticated, ProtocolError> {
        let auth = self
            .table
            .authenticate(id, &self.local_id, handshake, now_ms)?;
        if let Some(old) = &auth.superseded {
            let old_id = old.connection.connection_id;
            debug!("{} supersedes {} for {}", id, old_id, handshake.sender_id);
            if let Some(sink) = self.sinks.remove(&old_id) {
                sink.close().await;
            }
            self.permits.remove(&old_id);
        }
        Ok(auth)
    }

    /// Send one envelope on one connection.
    pub async fn send(&self, id: ConnectionId, envelope: &Envelope) -> Result<(), ConnectionError> {
        let sink = self
            .sinks
            .get(&id)
            .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?;
        sink.send(envelope.to_json()).await
    }

    /// Serialize once and send to every authenticated connection.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        broadcast::broadcast(&self.table, &self.sinks, &envelope.to_json()).await
    }

    /// Close a connection's socket and drop it from the table.
    ///
    /// Returns `None` if the connection was already gone.
    pub async fn close(&mut self, id: ConnectionId) -> Option<ClosedConnection> {
        if let Some(sink) = self.sinks.remove(&id) {
            sink.close().await;
        }
        self.permits.remove(&id);
        self.table.close(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::test_support::RecordingSink;
    use mesh_core::{Message, PROTOCOL_VERSION};
    use mesh_core::protocol::ShutdownPayload;

    fn handshake(sender: &str) -> HandshakePayload {
        HandshakePayload {
            sender_id: sender.to_string(),
            genesis_proof: String::new(),
            capabilities: vec!["pulse".into(), "discovery".into()],
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn register(
        manager: &mut ConnectionManager<RecordingSink>,
        direction: Direction,
    ) -> (ConnectionId, RecordingSink) {
        let sink = RecordingSink::default();
        let handle = sink.clone();
        let permit = manager.try_reserve().unwrap();
        let id = manager.register(direction, "127.0.0.1:40000", 0, permit, |_| sink);
        (id, handle)
    }

    #[tokio::test]
    async fn test_register_starts_handshaking() {
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 10);
        let (id, _) = register(&mut manager, Direction::Inbound);

        assert!(manager.table().get(id).unwrap().state.is_handshaking());
    }

    #[tokio::test]
    async fn test_close_closes_socket() {
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 10);
        let (id, sink) = register(&mut manager, Direction::Inbound);
        manager.authenticate(id, &handshake("aaaa"), 0).await.unwrap();

        let closed = manager.close(id).await.unwrap();

        assert!(sink.is_closed());
        assert_eq!(closed.peer.unwrap().peer_id, "aaaa");
        assert!(manager.table().is_empty());
        assert!(manager.close(id).await.is_none());
    }

    #[tokio::test]
    async fn test_superseded_socket_is_closed() {
        // Local "bbbb" < remote "cccc": our outbound dial wins
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 10);
        let (inbound, inbound_sink) = register(&mut manager, Direction::Inbound);
        manager.authenticate(inbound, &handshake("cccc"), 0).await.unwrap();

        let (outbound, outbound_sink) = register(&mut manager, Direction::Outbound);
        manager.mark_handshake_sent(outbound);
        let auth = manager
            .authenticate(outbound, &handshake("cccc"), 0)
            .await
            .unwrap();

        assert_eq!(auth.superseded.unwrap().connection.connection_id, inbound);
        assert!(inbound_sink.is_closed());
        assert!(!outbound_sink.is_closed());
        assert_eq!(manager.table().connection_for_peer("cccc"), Some(outbound));
    }

    #[tokio::test]
    async fn test_send_unknown_connection() {
        let manager = ConnectionManager::<RecordingSink>::new("bbbb", 10);
        let envelope = Envelope::new("bbbb", Message::Shutdown(ShutdownPayload::default()));

        assert!(matches!(
            manager.send(ConnectionId::new(99), &envelope).await,
            Err(ConnectionError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_serializes_envelope() {
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 10);
        let (id, sink) = register(&mut manager, Direction::Inbound);
        manager.authenticate(id, &handshake("aaaa"), 0).await.unwrap();

        let envelope = Envelope::new("bbbb", Message::Shutdown(ShutdownPayload::default()));
        let report = manager.broadcast(&envelope).await;

        assert_eq!(report.delivered, vec![id]);
        let frame = sink.sent.lock().unwrap()[0].clone();
        assert_eq!(frame, envelope.to_json());
    }

    // ==================== Slots ====================

    #[tokio::test]
    async fn test_reserved_slots_count_against_limit() {
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 2);
        let (id, _) = register(&mut manager, Direction::Inbound);

        // A dial in progress holds the second slot
        let pending = manager.try_reserve().unwrap();
        assert!(manager.try_reserve().is_none());

        drop(pending);
        assert!(manager.try_reserve().is_some());

        let _pending = manager.try_reserve().unwrap();
        manager.close(id).await;
        assert!(manager.try_reserve().is_some());
    }

    #[tokio::test]
    async fn test_superseded_connection_releases_slot() {
        let mut manager = ConnectionManager::<RecordingSink>::new("bbbb", 2);
        let (inbound, _) = register(&mut manager, Direction::Inbound);
        manager.authenticate(inbound, &handshake("cccc"), 0).await.unwrap();
        let (outbound, _) = register(&mut manager, Direction::Outbound);
        manager.mark_handshake_sent(outbound);
        assert!(manager.try_reserve().is_none());

        manager.authenticate(outbound, &handshake("cccc"), 0).await.unwrap();

        assert!(manager.try_reserve().is_some());
    }

    #[test]
    fn test_slots_are_shared() {
        let manager = ConnectionManager::<RecordingSink>::new("bbbb", 1);
        let _permit = manager.slots().try_acquire_owned().unwrap();
        assert!(manager.try_reserve().is_none());
    }
}
