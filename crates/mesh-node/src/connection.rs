//! Individual peer connection tasks.
//!
//! Each connection splits its WebSocket stream into a read task and a write
//! task. The read task forwards frames in order to the node actor; the write
//! task drains a queue so the actor never waits on a slow peer. Both are
//! bounded by timeouts and report failures back as a close. Neither outlives
//! the connection: a closed connection gets [`CLOSE_GRACE`] to flush its
//! queue, a dropped one is stopped at once.

use crate::broadcast::ConnectionSink;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mesh_core::protocol::MAX_MESSAGE_SIZE;
use mesh_core::{CloseReason, ConnectionError, ConnectionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, warn};

/// How long a closed connection's writer may keep flushing.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket stream used for both inbound and outbound connections.
pub type WsStream = WebSocketStream<TcpStream>;

/// Event reported by a connection's tasks to the node actor.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A frame arrived from the peer
    Frame {
        connection_id: ConnectionId,
        data: Vec<u8>,
    },
    /// The socket is gone
    Closed {
        connection_id: ConnectionId,
        reason: CloseReason,
    },
}

/// Per-frame I/O limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// Longest silence tolerated from the peer
    pub read: Duration,
    /// Longest a single frame write may take
    pub write: Duration,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// A live WebSocket connection to a peer.
pub struct PeerConnection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    closing: AtomicBool,
}

impl PeerConnection {
    /// Start the read and write tasks for an established stream.
    pub fn spawn(
        connection_id: ConnectionId,
        ws_stream: WsStream,
        timeouts: ConnectionTimeouts,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let (outgoing, queue) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(Self::read_loop(
            connection_id,
            read,
            timeouts.read,
            event_tx.clone(),
        ));
        let write_task = tokio::spawn(Self::write_loop(
            connection_id,
            write,
            queue,
            timeouts.write,
            event_tx,
        ));

        Self {
            outgoing,
            read_task,
            write_task,
            closing: AtomicBool::new(false),
        }
    }

    async fn read_loop(
        connection_id: ConnectionId,
        mut read: SplitStream<WsStream>,
        read_timeout: Duration,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let reason = loop {
            let next = match timeout(read_timeout, read.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        "No frame from {} in {:?}, closing",
                        connection_id, read_timeout
                    );
                    break CloseReason::NetworkError;
                }
            };

            match next {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", connection_id);
                            break CloseReason::RemoteClosed;
                        }
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            connection_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if event_tx
                        .send(ConnectionEvent::Frame {
                            connection_id,
                            data,
                        })
                        .is_err()
                    {
                        // Node is gone
                        return;
                    }
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection {} stream ended", connection_id);
                    break CloseReason::RemoteClosed;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error on {}: {}", connection_id, e);
                    break CloseReason::NetworkError;
                }
            }
        };

        let _ = event_tx.send(ConnectionEvent::Closed {
            connection_id,
            reason,
        });
    }

    async fn write_loop(
        connection_id: ConnectionId,
        mut write: SplitSink<WsStream, Message>,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
        write_timeout: Duration,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        while let Some(item) = queue.recv().await {
            let (msg, closing) = match item {
                Outgoing::Frame(data) => (Message::Binary(data), false),
                Outgoing::Close => (Message::Close(None), true),
            };

            let error = match timeout(write_timeout, write.send(msg)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(ConnectionError::WebSocket(e.to_string())),
                Err(_) => Some(ConnectionError::Timeout(write_timeout)),
            };

            if let Some(e) = error {
                if !closing {
                    warn!("Failed to write to {}: {}", connection_id, e);
                    let _ = event_tx.send(ConnectionEvent::Closed {
                        connection_id,
                        reason: CloseReason::NetworkError,
                    });
                }
                return;
            }
            if closing {
                return;
            }
        }
    }
}

#[async_trait]
impl ConnectionSink for PeerConnection {
    async fn send(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.outgoing
            .send(Outgoing::Frame(data))
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outgoing.send(Outgoing::Close);
        self.read_task.abort();

        // The writer stops after the close frame; a peer that stopped reading
        // must not keep it alive
        let writer = self.write_task.abort_handle();
        tokio::spawn(async move {
            sleep(CLOSE_GRACE).await;
            writer.abort();
        });
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.read_task.abort();
        if !self.closing.load(Ordering::SeqCst) {
            self.write_task.abort();
        }
    }
}
