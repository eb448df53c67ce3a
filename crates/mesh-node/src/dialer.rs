//! Outbound side: dialing known peers with per-address backoff.
//!
//! The dialer keeps no sockets. It decides which directory addresses are due
//! for a dial attempt and remembers failures so an unreachable address is
//! retried with exponential backoff instead of on every tick.

use crate::connection::WsStream;
use crate::listener::{CLIENT_HEADER, CLIENT_TYPE};
use mesh_core::ConnectionError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info};

/// Configuration for redial behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            ..Self::default()
        }
    }
}

/// Calculates the delay after the `attempt`-th consecutive failure.
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Dial state for one address.
#[derive(Debug, Clone, Default)]
pub struct DialState {
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Earliest time for the next attempt (ms since epoch)
    pub next_attempt_at: Option<u64>,
    /// A dial is currently running
    pub in_flight: bool,
}

impl DialState {
    /// Check if an attempt may start now.
    pub fn is_due(&self, now_ms: u64) -> bool {
        !self.in_flight && self.next_attempt_at.is_none_or(|t| now_ms >= t)
    }
}

/// Tracks dial attempts across all directory addresses.
#[derive(Debug, Default)]
pub struct Dialer {
    config: BackoffConfig,
    states: HashMap<String, DialState>,
}

impl Dialer {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Addresses that should be dialed now.
    ///
    /// `skip` is consulted for every candidate and filters out addresses that
    /// are already connected (or are our own).
    pub fn due<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a str>,
        now_ms: u64,
        skip: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        addresses
            .into_iter()
            .filter(|addr| !skip(addr))
            .filter(|addr| self.states.get(*addr).is_none_or(|s| s.is_due(now_ms)))
            .map(str::to_string)
            .collect()
    }

    /// Mark a dial as started.
    pub fn begin(&mut self, address: &str) {
        self.states.entry(address.to_string()).or_default().in_flight = true;
    }

    /// Schedule the next attempt after a failed dial or a dropped connection.
    pub fn record_failure(&mut self, address: &str, now_ms: u64) -> Duration {
        let state = self.states.entry(address.to_string()).or_default();
        state.in_flight = false;
        state.attempts += 1;
        let delay = calculate_backoff(state.attempts, &self.config);
        state.next_attempt_at = Some(now_ms + delay.as_millis() as u64);
        info!(
            "Next dial to {} in {:?} (attempt {})",
            address, delay, state.attempts
        );
        delay
    }

    /// Reset state after a connection to `address` authenticated.
    pub fn record_success(&mut self, address: &str) {
        self.states.remove(address);
    }

    /// Drop all state for an address that left the directory.
    pub fn forget(&mut self, address: &str) {
        self.states.remove(address);
    }

    pub fn state(&self, address: &str) -> Option<&DialState> {
        self.states.get(address)
    }
}

/// Open a WebSocket connection to `address` ("host:port").
///
/// The TCP connect and the upgrade together are bounded by `limit`.
pub async fn dial(address: &str, limit: Duration) -> Result<WsStream, ConnectionError> {
    let mut request = format!("ws://{}", address)
        .into_client_request()
        .map_err(|e| ConnectionError::WebSocket(e.to_string()))?;
    request
        .headers_mut()
        .insert(CLIENT_HEADER, HeaderValue::from_static(CLIENT_TYPE));

    let connect = async {
        let stream = TcpStream::connect(address).await?;
        let (ws, _) = client_async(request, stream)
            .await
            .map_err(|e| ConnectionError::Refused {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok::<_, ConnectionError>(ws)
    };

    let ws = timeout(limit, connect)
        .await
        .map_err(|_| ConnectionError::Timeout(limit))??;
    debug!("Dialed {}", address);
    Ok(ws)
}
