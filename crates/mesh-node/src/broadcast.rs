//! Fan-out of one serialized frame to every authenticated connection.

use async_trait::async_trait;
use mesh_core::{ConnectionError, ConnectionId, ConnectionTable};
use std::collections::HashMap;
use tracing::debug;

/// Write side of a live connection.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Queue a frame for the peer.
    async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError>;

    /// Send a close frame and stop reading.
    async fn close(&self);
}

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, ConnectionError)>,
}

/// Write `data` to every authenticated connection in `table`.
///
/// A failed write is recorded and delivery continues with the remaining
/// connections; tearing down the failed ones is up to the caller.
pub async fn broadcast<S: ConnectionSink>(
    table: &ConnectionTable,
    sinks: &HashMap<ConnectionId, S>,
    data: &[u8],
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for id in table.authenticated() {
        let result = match sinks.get(&id) {
            Some(sink) => sink.send(data.to_vec()).await,
            None => Err(ConnectionError::UnknownConnection(id.to_string())),
        };
        match result {
            Ok(()) => report.delivered.push(id),
            Err(e) => {
                debug!("Broadcast to {} failed: {}", id, e);
                report.failed.push((id, e));
            }
        }
    }

    report
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use mesh_core::{Direction, HandshakePayload, PROTOCOL_VERSION};

    fn authenticated(table: &mut ConnectionTable, peer: &str) -> ConnectionId {
        let id = table.open(Direction::Inbound, "127.0.0.1:40000", 0);
        table.begin_handshake(id);
        let handshake = HandshakePayload {
            sender_id: peer.to_string(),
            genesis_proof: String::new(),
            capabilities: vec!["pulse".into()],
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        table.authenticate(id, "local", &handshake, 0).unwrap();
        id
    }

    #[tokio::test]
    async fn test_partial_failure_still_delivers() {
        let mut table = ConnectionTable::new();
        let a = authenticated(&mut table, "peer-a");
        let b = authenticated(&mut table, "peer-b");
        let c = authenticated(&mut table, "peer-c");

        let mut sinks = HashMap::new();
        let sink_a = RecordingSink::default();
        let sink_c = RecordingSink::default();
        sinks.insert(a, sink_a.clone());
        sinks.insert(b, RecordingSink::failing());
        sinks.insert(c, sink_c.clone());

        let report = broadcast(&table, &sinks, b"frame").await;

        assert_eq!(report.delivered, vec![a, c]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, b);
        assert_eq!(sink_a.frames(), 1);
        assert_eq!(sink_c.frames(), 1);
    }

    #[tokio::test]
    async fn test_skips_unauthenticated() {
        let mut table = ConnectionTable::new();
        let a = authenticated(&mut table, "peer-a");
        let pending = table.open(Direction::Inbound, "127.0.0.1:40001", 0);
        table.begin_handshake(pending);

        let mut sinks = HashMap::new();
        let sink_a = RecordingSink::default();
        let sink_pending = RecordingSink::default();
        sinks.insert(a, sink_a.clone());
        sinks.insert(pending, sink_pending.clone());

        let report = broadcast(&table, &sinks, b"frame").await;

        assert_eq!(report.delivered, vec![a]);
        assert_eq!(sink_pending.frames(), 0);
    }

    #[tokio::test]
    async fn test_missing_sink_is_a_failure() {
        let mut table = ConnectionTable::new();
        let a = authenticated(&mut table, "peer-a");
        let sinks: HashMap<ConnectionId, RecordingSink> = HashMap::new();

        let report = broadcast(&table, &sinks, b"frame").await;

        assert!(report.delivered.is_empty());
        assert!(matches!(
            report.failed.as_slice(),
            [(id, ConnectionError::UnknownConnection(_))] if *id == a
        ));
    }
}
