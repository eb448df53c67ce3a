//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StorageError;

/// Main configuration for a mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    /// Interface to listen on
    pub listen_address: String,
    /// Port to listen on (0 = pick any free port)
    pub listen_port: u16,
    /// Address other nodes can dial us at ("host:port"), gossiped via discovery
    pub advertise_address: Option<String>,
    /// Maximum live connections, inbound and outbound combined
    pub max_connections: usize,
    pub pulse_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How often to sweep for connections stuck in handshake
    pub sweep_interval_ms: u64,
    /// How often to check the peer directory for addresses to dial
    pub dial_interval_ms: u64,
    pub dial_backoff_initial_ms: u64,
    pub dial_backoff_max_ms: u64,
    /// Accepted clock skew for message timestamps, in either direction
    pub max_clock_skew_ms: u64,
    /// Capabilities advertised in our handshake
    pub capabilities: Vec<String>,
    /// Pulse payload field read as the numeric signal
    pub signal_field: String,
    /// Moving-average divergence from our own signal that gets logged as drift
    pub drift_threshold: f64,
    /// Directory holding identity and peer directory files
    pub data_dir: String,
    /// Addresses ("host:port") seeded into the peer directory on startup
    pub bootstrap_peers: Vec<String>,
    /// Addresses the peer directory holds before gossip is ignored
    pub max_known_peers: usize,
    /// Consecutive failed dials after which a never-connected address is forgotten
    pub max_dial_failures: u32,
    pub signal: SignalConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9001,
            advertise_address: None,
            max_connections: 50,
            pulse_interval_ms: 5_000,
            sync_interval_ms: 30_000,
            handshake_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
            dial_interval_ms: 5_000,
            dial_backoff_initial_ms: 5_000,
            dial_backoff_max_ms: 60_000,
            max_clock_skew_ms: 5 * 60 * 1_000,
            capabilities: vec!["pulse".to_string(), "discovery".to_string()],
            signal_field: "signal".to_string(),
            drift_threshold: 10.0,
            data_dir: ".mesh".to_string(),
            bootstrap_peers: Vec::new(),
            max_known_peers: 1_000,
            max_dial_failures: 10,
            signal: SignalConfig::default(),
        }
    }
}

/// Tuning for the signal analyzer's ratio pattern detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalConfig {
    /// Ring buffer capacity per peer
    pub history_capacity: usize,
    /// Samples required before detection runs
    pub min_samples: usize,
    /// Candidate ratios, tried in order
    pub ratios: Vec<f64>,
    /// Absolute distance from `first * ratio` that still counts as a match
    pub tolerance: f64,
    /// Match fraction that must be exceeded to report a pattern
    pub match_threshold: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            min_samples: 10,
            ratios: vec![1.0 / 2.0, 2.0 / 3.0, 3.0 / 4.0, 3.0 / 5.0, 4.0 / 5.0, 5.0 / 6.0],
            tolerance: 0.1,
            match_threshold: 0.6,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a JSON file.
    ///
    /// If the file does not exist, the defaults are written there for reference.
    pub fn load(config_file: &Path) -> Result<Self, StorageError> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file).map_err(|source| {
                StorageError::Io {
                    path: config_file.to_path_buf(),
                    source,
                }
            })?;
            let config: MeshConfig =
                serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
                    path: config_file.to_path_buf(),
                    reason: e.to_string(),
                })?;
            info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            info!("No config file found at {:?}, using defaults", config_file);
            let config = MeshConfig::default();

            let io_err = |source| StorageError::Io {
                path: config_file.to_path_buf(),
                source,
            };
            if let Some(parent) = config_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            let content = serde_json::to_string_pretty(&config)
                .expect("MeshConfig serialization should not fail");
            std::fs::write(config_file, content).map_err(io_err)?;
            info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_millis(self.pulse_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn dial_interval(&self) -> Duration {
        Duration::from_millis(self.dial_interval_ms)
    }
}
