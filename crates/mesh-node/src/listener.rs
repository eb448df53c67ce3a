//! Inbound side: TCP listener and the filtered WebSocket upgrade.
//!
//! Upgrade requests must declare the client type in a header. Requests
//! without it, and requests arriving while the node is at its connection
//! limit, are refused with an HTTP error. A connection slot is taken only
//! once the request has passed the header check, so a socket that never
//! sends a request holds nothing.

use crate::connection::WsStream;
use mesh_core::ConnectionError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tracing::{debug, info};

/// Header every mesh client sends with its upgrade request.
pub const CLIENT_HEADER: &str = "x-mesh-client";
/// Expected value of [`CLIENT_HEADER`].
pub const CLIENT_TYPE: &str = "mesh-node";

/// Bind the listening socket.
pub async fn bind(listen_addr: &str) -> Result<TcpListener, ConnectionError> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Mesh node listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Whether the request declares itself as a mesh client.
pub fn has_client_header(headers: &HeaderMap) -> bool {
    headers
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(CLIENT_TYPE))
}

/// Decide whether to accept an upgrade request, taking a slot if so.
pub fn admit(
    headers: &HeaderMap,
    slots: &Arc<Semaphore>,
) -> Result<OwnedSemaphorePermit, StatusCode> {
    if !has_client_header(headers) {
        return Err(StatusCode::BAD_REQUEST);
    }
    slots
        .clone()
        .try_acquire_owned()
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(status.canonical_reason().map(str::to_string));
    *response.status_mut() = status;
    response
}

/// Upgrade an accepted TCP stream to a WebSocket, applying the admission
/// filter. The whole upgrade is bounded by `limit`.
///
/// On success the returned permit is the new connection's slot.
pub async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    slots: Arc<Semaphore>,
    limit: Duration,
) -> Result<(WsStream, OwnedSemaphorePermit), ConnectionError> {
    let mut permit = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        permit = Some(admit(request.headers(), &slots).map_err(reject)?);
        Ok(response)
    };

    let result = timeout(limit, accept_hdr_async(stream, callback)).await;
    match result {
        Ok(Ok(ws)) => permit.map(|permit| (ws, permit)).ok_or(ConnectionError::AtCapacity),
        Ok(Err(WsError::Http(response))) => {
            let status = response.status();
            debug!("Refused upgrade from {}: {}", addr, status);
            Err(if status == StatusCode::SERVICE_UNAVAILABLE {
                ConnectionError::AtCapacity
            } else {
                ConnectionError::Refused {
                    address: addr.to_string(),
                    reason: status.to_string(),
                }
            })
        }
        Ok(Err(e)) => Err(ConnectionError::WebSocket(e.to_string())),
        Err(_) => Err(ConnectionError::Timeout(limit)),
    }
}
