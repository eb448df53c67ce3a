//! The node actor.
//!
//! A single task owns every piece of mutable state: the connection manager,
//! the signal analyzer, the peer directory and the dialer. Sockets, upgrades
//! and dials run in their own tasks and report back over channels; timers are
//! intervals polled by the same loop, so leaving the loop cancels them all.
//!
//! Callers interact through a [`NodeHandle`] and observe the node through
//! the [`MeshEvent`] channel returned by [`Node::bind`].

use crate::connection::{ConnectionEvent, ConnectionTimeouts, PeerConnection, WsStream};
use crate::dialer::{self, BackoffConfig, Dialer};
use crate::listener;
use crate::manager::ConnectionManager;
use mesh_core::protocol::{
    AlertPayload, DiscoveryPayload, PatternBroadcastPayload, PulsePayload, SharedPattern,
    ShutdownPayload,
};
use mesh_core::protocol::message::HANDSHAKE;
use mesh_core::signal::SignalHistoryEntry;
use mesh_core::{
    ClosedConnection, CloseReason, Connection, ConnectionError, ConnectionId, Direction, Envelope,
    HandshakePayload, MeshConfig, MeshEvent, Message, NodeIdentity, PeerDirectory, PeerRecord,
    ProtocolError, SignalAnalyzer, StateProvider, now_ms,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Identity file name inside the data directory.
pub const IDENTITY_FILE: &str = "identity.json";
/// Peer directory file name inside the data directory.
pub const KNOWN_PEERS_FILE: &str = "known_peers.json";

/// Requests from a [`NodeHandle`] to the actor.
enum Command {
    Shutdown,
    Dial(String),
    Pulse(Value),
    Alert(Value),
    Snapshot(oneshot::Sender<NodeSnapshot>),
}

/// Socket plus the connection slot it holds.
type Established = (WsStream, OwnedSemaphorePermit);

/// Result of an upgrade or dial running outside the actor.
enum Setup {
    Inbound {
        address: String,
        result: Result<Established, ConnectionError>,
    },
    Outbound {
        address: String,
        result: Result<Established, ConnectionError>,
    },
}

/// Point-in-time view of a node's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub node_id: String,
    pub connections: Vec<Connection>,
    pub peers: Vec<PeerRecord>,
    pub known_addresses: Vec<String>,
    pub signal_histories: BTreeMap<String, Vec<SignalHistoryEntry>>,
    /// Latest pattern each peer advertised about its own signal
    pub shared_patterns: BTreeMap<String, SharedPattern>,
    pub derived_signal: f64,
}

impl NodeSnapshot {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn history(&self, peer_id: &str) -> &[SignalHistoryEntry] {
        self.signal_histories
            .get(peer_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Cloneable handle for talking to a running node.
///
/// Every method is fire-and-forget: once the node has stopped they do
/// nothing, which makes [`NodeHandle::shutdown`] safe to call repeatedly.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: String,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Notify peers, close every connection and stop the node.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Add `address` ("host:port") to the peer directory and dial it now.
    pub fn dial(&self, address: impl Into<String>) {
        let _ = self.commands.send(Command::Dial(address.into()));
    }

    /// Broadcast a pulse with an explicit payload, outside the pulse interval.
    pub fn broadcast_pulse(&self, payload: Value) {
        let _ = self.commands.send(Command::Pulse(payload));
    }

    /// Broadcast an alert to every authenticated peer.
    pub fn broadcast_alert(&self, payload: Value) {
        let _ = self.commands.send(Command::Alert(payload));
    }

    /// Current state, or `None` if the node has stopped.
    pub async fn snapshot(&self) -> Option<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }
}

/// A mesh node: listener, connections, timers and protocol state.
pub struct Node {
    identity: NodeIdentity,
    config: MeshConfig,
    handshake: HandshakePayload,
    provider: Arc<dyn StateProvider>,

    manager: ConnectionManager,
    analyzer: SignalAnalyzer,
    directory: PeerDirectory,
    dialer: Dialer,

    listener: Option<TcpListener>,
    /// Addresses that point back at this node and are never dialed
    self_addresses: HashSet<String>,

    events: mpsc::UnboundedSender<MeshEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    setup_tx: mpsc::UnboundedSender<Setup>,
    setup_rx: mpsc::UnboundedReceiver<Setup>,
}

impl Node {
    /// Bind the listener and assemble a node ready to [`run`](Node::run).
    ///
    /// Bootstrap peers from the config are added to the directory.
    pub async fn bind(
        identity: NodeIdentity,
        config: MeshConfig,
        mut directory: PeerDirectory,
        provider: Arc<dyn StateProvider>,
    ) -> Result<(Self, NodeHandle, mpsc::UnboundedReceiver<MeshEvent>), ConnectionError> {
        let listener = listener::bind(&config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;

        let mut self_addresses = HashSet::from([
            local_addr.to_string(),
            format!("127.0.0.1:{}", local_addr.port()),
            format!("localhost:{}", local_addr.port()),
        ]);
        if let Some(advertised) = &config.advertise_address {
            self_addresses.insert(advertised.clone());
        }

        directory.set_capacity(config.max_known_peers);
        for address in &config.bootstrap_peers {
            if !self_addresses.contains(address) && directory.add_address(address, None) {
                debug!("Added bootstrap peer {}", address);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (setup_tx, setup_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            node_id: identity.id.clone(),
            local_addr,
            commands: commands_tx,
        };

        let node = Self {
            handshake: HandshakePayload::new(&identity, &config.capabilities),
            manager: ConnectionManager::new(identity.id.clone(), config.max_connections),
            analyzer: SignalAnalyzer::new(config.signal.clone()),
            dialer: Dialer::new(BackoffConfig::from_millis(
                config.dial_backoff_initial_ms,
                config.dial_backoff_max_ms,
            )),
            identity,
            config,
            provider,
            directory,
            listener: Some(listener),
            self_addresses,
            events: events_tx,
            commands: commands_rx,
            connection_tx,
            connection_rx,
            setup_tx,
            setup_rx,
        };

        Ok((node, handle, events_rx))
    }

    /// Run until shut down through a handle, or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            "Node {} running (protocol {}, capabilities {:?})",
            self.identity.id, self.handshake.protocol_version, self.handshake.capabilities
        );

        let mut pulse = ticker(self.config.pulse_interval());
        let mut sync = ticker(self.config.sync_interval());
        let mut sweep = ticker(self.config.sweep_interval());
        let mut dial = ticker(self.config.dial_interval());

        self.dial_due();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },

                accepted = accept(&self.listener) => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },

                Some(event) = self.connection_rx.recv() => match event {
                    ConnectionEvent::Frame { connection_id, data } => {
                        self.on_frame(connection_id, &data).await;
                    }
                    ConnectionEvent::Closed { connection_id, reason } => {
                        self.close_connection(connection_id, reason).await;
                    }
                },

                Some(setup) = self.setup_rx.recv() => self.on_setup(setup).await,

                _ = pulse.tick() => self.on_pulse_tick().await,
                _ = sync.tick() => self.on_sync_tick().await,
                _ = sweep.tick() => self.on_sweep().await,
                _ = dial.tick() => self.dial_due(),
            }
        }

        self.shutdown().await;
    }

    // ==================== Commands ====================

    async fn on_command(&mut self, command: Command) {
        match command {
            // Handled by the run loop
            Command::Shutdown => {}
            Command::Dial(address) => {
                if self.self_addresses.contains(&address) {
                    warn!("Not dialing {}: that's this node", address);
                    return;
                }
                self.directory.add_address(&address, None);
                self.dial_due();
            }
            Command::Pulse(payload) => self.broadcast_pulse(payload).await,
            Command::Alert(payload) => {
                self.broadcast(Message::Alert(AlertPayload(payload))).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        let table = self.manager.table();
        let mut connections: Vec<_> = table.connections().cloned().collect();
        connections.sort_by_key(|c| c.connection_id);

        let signal_histories = self
            .analyzer
            .tracked_peers()
            .filter_map(|peer| Some((peer.to_string(), self.analyzer.history(peer)?)))
            .collect();
        let shared_patterns = self
            .analyzer
            .tracked_peers()
            .filter_map(|peer| Some((peer.to_string(), self.analyzer.shared_pattern(peer)?.clone())))
            .collect();

        NodeSnapshot {
            node_id: self.identity.id.clone(),
            connections,
            peers: table.peers().cloned().collect(),
            known_addresses: self.directory.addresses().map(str::to_string).collect(),
            signal_histories,
            shared_patterns,
            derived_signal: self.analyzer.derived_signal(),
        }
    }

    // ==================== Connection setup ====================

    /// Upgrade off the actor. The slot is taken inside the upgrade, once the
    /// request has passed the header filter.
    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let slots = self.manager.slots();
        let limit = self.config.handshake_timeout();
        let setup_tx = self.setup_tx.clone();
        tokio::spawn(async move {
            let result = listener::upgrade(stream, addr, slots, limit).await;
            let _ = setup_tx.send(Setup::Inbound {
                address: addr.to_string(),
                result,
            });
        });
    }

    /// Start dials to every directory address that is due.
    fn dial_due(&mut self) {
        let now = now_ms();
        let table = self.manager.table();
        let directory = &self.directory;
        let self_addresses = &self.self_addresses;

        let due = self.dialer.due(directory.addresses(), now, |address| {
            self_addresses.contains(address)
                || table.has_outbound_to(address)
                || directory
                    .get(address)
                    .and_then(|p| p.peer_id.as_deref())
                    .is_some_and(|peer_id| table.is_connected(peer_id))
        });

        for address in due {
            let Some(permit) = self.manager.try_reserve() else {
                debug!("At capacity, postponing remaining dials");
                break;
            };
            self.dialer.begin(&address);

            let limit = self.config.handshake_timeout();
            let setup_tx = self.setup_tx.clone();
            tokio::spawn(async move {
                // A failed dial drops the permit here
                let result = dialer::dial(&address, limit).await.map(|ws| (ws, permit));
                let _ = setup_tx.send(Setup::Outbound { address, result });
            });
        }
    }

    async fn on_setup(&mut self, setup: Setup) {
        let now = now_ms();

        match setup {
            Setup::Inbound { address, result } => match result {
                Ok(established) => {
                    self.open_connection(Direction::Inbound, &address, established, now);
                }
                Err(ConnectionError::AtCapacity) => {
                    warn!("Refused connection from {}: at capacity", address);
                }
                Err(e) => debug!("Inbound upgrade from {} failed: {}", address, e),
            },
            Setup::Outbound { address, result } => match result {
                Ok(established) => {
                    let id = self.open_connection(Direction::Outbound, &address, established, now);
                    // Outbound side speaks first
                    self.send_handshake(id).await;
                }
                Err(e) => {
                    warn!("Dial to {} failed: {}", address, e);
                    self.record_dial_failure(&address, now);
                }
            },
        }
    }

    fn open_connection(
        &mut self,
        direction: Direction,
        address: &str,
        (ws, permit): Established,
        now: u64,
    ) -> ConnectionId {
        let timeouts = ConnectionTimeouts {
            read: self.config.read_timeout(),
            write: self.config.write_timeout(),
        };
        let event_tx = self.connection_tx.clone();
        self.manager.register(direction, address, now, permit, |id| {
            PeerConnection::spawn(id, ws, timeouts, event_tx)
        })
    }

    /// Back off from `address`, and forget it once it has failed too often
    /// without ever having connected. Bootstrap peers are never forgotten.
    fn record_dial_failure(&mut self, address: &str, now: u64) {
        self.dialer.record_failure(address, now);

        let attempts = self.dialer.state(address).map_or(0, |s| s.attempts);
        let never_connected = self
            .directory
            .get(address)
            .is_none_or(|p| p.peer_id.is_none());
        let bootstrap = self.config.bootstrap_peers.iter().any(|a| a == address);

        if attempts >= self.config.max_dial_failures && never_connected && !bootstrap {
            info!("Forgetting {} after {} failed dials", address, attempts);
            self.directory.remove(address);
            self.dialer.forget(address);
        }
    }

    async fn send_handshake(&mut self, id: ConnectionId) {
        if !self.manager.mark_handshake_sent(id) {
            return;
        }
        let envelope = Envelope::new(&self.identity.id, Message::Handshake(self.handshake.clone()));
        if let Err(e) = self.manager.send(id, &envelope).await {
            warn!("Failed to send handshake on {}: {}", id, e);
            self.close_connection(id, CloseReason::NetworkError).await;
        }
    }

    // ==================== Inbound messages ====================

    async fn on_frame(&mut self, id: ConnectionId, data: &[u8]) {
        // Frames can still arrive from a connection closed a moment ago
        if self.manager.table().get(id).is_none() {
            return;
        }

        let now = now_ms();
        self.manager.touch(id, now);

        let envelope = match Envelope::decode(data, now, self.config.max_clock_skew_ms) {
            Ok(envelope) => envelope,
            Err(e) => {
                let authenticated = self.manager.table().peer_for(id).is_some();
                let handshake = Envelope::peek_kind(data).as_deref() == Some(HANDSHAKE);
                if handshake && !authenticated {
                    // An undecodable handshake is a failed handshake
                    warn!("Rejecting handshake on {}: {}", id, e);
                    self.close_connection(id, CloseReason::ProtocolError).await;
                    return;
                }
                warn!(
                    "Dropping message on {} (peer: {}): {}",
                    id,
                    self.manager.table().peer_for(id).unwrap_or("unauthenticated"),
                    e
                );
                return;
            }
        };

        let Envelope {
            sender_id, message, ..
        } = envelope;
        let kind = message.kind().to_string();
        let peer_id = self.manager.table().peer_for(id).map(str::to_string);

        match (message, peer_id) {
            (Message::Handshake(handshake), _) => {
                self.on_handshake(id, &sender_id, handshake).await;
            }
            (_, None) => {
                debug!("Dropping {} on {}: not authenticated", kind, id);
            }
            (_, Some(peer_id)) if peer_id != sender_id => {
                warn!(
                    "Dropping {} on {}: sender {} is not the authenticated peer {}",
                    kind, id, sender_id, peer_id
                );
            }
            (Message::Pulse(pulse), Some(peer_id)) => {
                if let Some(value) = pulse.signal(&self.config.signal_field) {
                    self.observe(&peer_id, value, now);
                }
                self.emit(MeshEvent::PulseReceived {
                    peer_id,
                    payload: pulse.0,
                });
            }
            (Message::PatternBroadcast(broadcast), Some(peer_id)) => {
                self.observe(&peer_id, broadcast.signal, now);
                if let Some(pattern) = broadcast.pattern {
                    debug!(
                        "{} shares pattern ratio {} (strength {})",
                        peer_id, pattern.ratio, pattern.strength
                    );
                    self.analyzer.record_shared(&peer_id, pattern);
                }
            }
            (Message::Alert(alert), Some(peer_id)) => {
                info!("Alert from {}", peer_id);
                self.emit(MeshEvent::AlertReceived {
                    peer_id,
                    payload: alert.0,
                });
            }
            (Message::Discovery(discovery), Some(peer_id)) => {
                self.on_discovery(&peer_id, discovery);
            }
            (Message::Shutdown(shutdown), Some(peer_id)) => {
                info!(
                    "Peer {} is shutting down ({})",
                    peer_id,
                    shutdown.reason.as_deref().unwrap_or("no reason given")
                );
                self.close_connection(id, CloseReason::RemoteShutdown).await;
            }
            (Message::Unknown { kind }, Some(peer_id)) => {
                debug!("Ignoring unknown message type {} from {}", kind, peer_id);
            }
        }
    }

    async fn on_handshake(&mut self, id: ConnectionId, sender_id: &str, handshake: HandshakePayload) {
        if let Some(peer_id) = self.manager.table().peer_for(id) {
            debug!("Ignoring repeated handshake on {} from {}", id, peer_id);
            return;
        }

        if let Err(e) = handshake.validate(sender_id, &self.identity.id) {
            warn!("Rejecting handshake on {}: {}", id, e);
            self.close_connection(id, CloseReason::ProtocolError).await;
            return;
        }

        let now = now_ms();
        let auth = match self.manager.authenticate(id, &handshake, now).await {
            Ok(auth) => auth,
            Err(ProtocolError::DuplicateConnection(peer_id)) => {
                info!("Closing {}: already connected to {}", id, peer_id);
                if let Some(conn) = self.manager.table().get(id) {
                    if conn.direction == Direction::Outbound {
                        let address = conn.remote_address.clone();
                        self.directory.record_connected(&address, &peer_id, now);
                        self.dialer.record_success(&address);
                    }
                }
                self.close_connection(id, CloseReason::Duplicate).await;
                return;
            }
            Err(e) => {
                debug!("Ignoring handshake on {}: {}", id, e);
                return;
            }
        };

        if let Some(superseded) = auth.superseded {
            self.on_closed(superseded, CloseReason::Duplicate);
        }

        let peer_id = auth.record.peer_id.clone();
        if handshake.should_warn_version() {
            info!(
                "Peer {} uses protocol {} (ours is {})",
                peer_id, handshake.protocol_version, self.handshake.protocol_version
            );
        }
        debug!("Peer {} genesis proof {}", peer_id, handshake.genesis_proof);

        self.analyzer.track(&peer_id);
        if auth.reply_needed {
            self.send_handshake(id).await;
        }

        if let Some(conn) = self.manager.table().get(id) {
            if conn.direction == Direction::Outbound {
                let address = conn.remote_address.clone();
                self.directory.record_connected(&address, &peer_id, now);
                self.dialer.record_success(&address);
            }
        }

        info!("Peer connected: {} on {}", peer_id, id);
        self.emit(MeshEvent::PeerConnected {
            peer_id: peer_id.clone(),
            connection_id: id,
        });

        self.share_known_addresses(id, &peer_id).await;
    }

    /// Tell a newly connected peer about every address we know of.
    async fn share_known_addresses(&mut self, id: ConnectionId, peer_id: &str) {
        let mut addresses: Vec<String> = self
            .directory
            .all()
            .iter()
            .filter(|p| p.peer_id.as_deref() != Some(peer_id))
            .map(|p| p.address.clone())
            .collect();
        if let Some(advertised) = &self.config.advertise_address {
            addresses.push(advertised.clone());
        }

        for address in addresses {
            let Some(payload) = DiscoveryPayload::from_socket_address(&address) else {
                continue;
            };
            let envelope = Envelope::new(&self.identity.id, Message::Discovery(payload));
            if let Err(e) = self.manager.send(id, &envelope).await {
                warn!("Failed to send discovery to {}: {}", peer_id, e);
                self.close_connection(id, CloseReason::NetworkError).await;
                return;
            }
        }
    }

    fn on_discovery(&mut self, peer_id: &str, discovery: DiscoveryPayload) {
        let address = discovery.socket_address();
        if self.self_addresses.contains(&address) {
            return;
        }
        if self.directory.add_address(&address, Some(peer_id)) {
            info!("Discovered {} via {}", address, peer_id);
        }
    }

    fn observe(&mut self, peer_id: &str, value: f64, now: u64) {
        if let Some(record) = self.analyzer.observe(peer_id, value, now) {
            info!(
                "Pattern detected for {}: ratio {:.3} of {} (strength {:.2})",
                record.peer_id, record.ratio, record.base_value, record.strength
            );
            self.emit(MeshEvent::PatternDetected(record));
        }
    }

    // ==================== Close ====================

    /// Tear down one connection. A connection that's already gone is ignored.
    async fn close_connection(&mut self, id: ConnectionId, reason: CloseReason) {
        if let Some(closed) = self.manager.close(id).await {
            self.on_closed(closed, reason);
        }
    }

    fn on_closed(&mut self, closed: ClosedConnection, reason: CloseReason) {
        let connection = closed.connection;
        let peer_id = closed.peer.map(|p| p.peer_id);

        if let Some(peer_id) = &peer_id {
            // A surviving duplicate keeps the history alive
            if !self.manager.table().is_connected(peer_id) {
                self.analyzer.forget(peer_id);
            }
        }

        if connection.direction == Direction::Outbound {
            match reason {
                CloseReason::Duplicate => self.dialer.record_success(&connection.remote_address),
                CloseReason::LocalShutdown => {}
                _ => self.record_dial_failure(&connection.remote_address, now_ms()),
            }
        }

        info!(
            "Connection {} closed ({:?}, peer: {})",
            connection.connection_id,
            reason,
            peer_id.as_deref().unwrap_or("unauthenticated")
        );
        self.emit(MeshEvent::PeerDisconnected {
            peer_id,
            connection_id: connection.connection_id,
            reason,
        });
    }

    // ==================== Timers ====================

    async fn on_pulse_tick(&mut self) {
        let payload = self.provider.summarize();
        self.broadcast_pulse(payload).await;
    }

    async fn broadcast_pulse(&mut self, payload: Value) {
        let pulse = PulsePayload(payload);
        if let Some(value) = pulse.signal(&self.config.signal_field) {
            self.analyzer.observe_local(value, now_ms());
        }
        self.broadcast(Message::Pulse(pulse)).await;
    }

    /// Synchronization round: share our derived signal, check drift and
    /// persist the directory.
    async fn on_sync_tick(&mut self) {
        let signal = self.analyzer.derived_signal();
        let pattern = self.analyzer.local_pattern();
        self.broadcast(Message::PatternBroadcast(PatternBroadcastPayload {
            signal,
            pattern,
        }))
        .await;

        for (peer_id, drift) in self.analyzer.drifting(signal, self.config.drift_threshold) {
            warn!(
                "Peer {} drifts {:.2} from our signal {:.2}",
                peer_id, drift, signal
            );
        }

        self.save_directory();
    }

    /// Close connections that didn't finish their handshake in time.
    async fn on_sweep(&mut self) {
        let limit = self.config.handshake_timeout();
        let expired = self
            .manager
            .table()
            .expired_handshakes(now_ms(), self.config.handshake_timeout_ms);

        for id in expired {
            warn!("Closing {}: {}", id, ProtocolError::HandshakeTimeout(limit));
            self.close_connection(id, CloseReason::HandshakeTimeout).await;
        }
    }

    // ==================== Broadcast / shutdown ====================

    async fn broadcast(&mut self, message: Message) {
        let envelope = Envelope::new(&self.identity.id, message);
        let report = self.manager.broadcast(&envelope).await;

        if !report.delivered.is_empty() {
            debug!(
                "Broadcast {} to {} peer(s)",
                envelope.kind(),
                report.delivered.len()
            );
        }
        for (id, e) in report.failed {
            warn!("Failed to send {} on {}: {}", envelope.kind(), id, e);
            self.close_connection(id, CloseReason::NetworkError).await;
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down node {}", self.identity.id);

        self.broadcast(Message::Shutdown(ShutdownPayload {
            reason: Some("node shutting down".to_string()),
        }))
        .await;

        for id in self.manager.table().connection_ids() {
            self.close_connection(id, CloseReason::LocalShutdown).await;
        }
        self.listener = None;

        self.save_directory();
        self.emit(MeshEvent::ShutdownComplete);
        info!("Shutdown complete");
    }

    fn save_directory(&mut self) {
        match self.directory.save_if_dirty() {
            Ok(true) => debug!("Saved peer directory to {:?}", self.directory.path()),
            Ok(false) => {}
            // Still dirty, so the next round retries
            Err(e) => error!("Failed to save peer directory: {}", e),
        }
    }

    fn emit(&self, event: MeshEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Interval whose first tick is one period from now.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
