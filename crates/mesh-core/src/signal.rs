//! Per-peer signal history and ratio pattern detection.
//!
//! Each tracked peer gets a fixed-capacity ring of received signal values.
//! After every observation the moving average is recomputed from the whole
//! buffer, and once enough samples are buffered the history is tested
//! against a small set of candidate ratios of its oldest value.
//!
//! This is a coarse heuristic for slowly varying signals, not a spectral
//! periodicity detector.

use crate::config::SignalConfig;
use crate::protocol::SharedPattern;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalHistoryEntry {
    pub value: f64,
    pub received_at: u64,
}

/// A ratio pattern detected in a peer's signal history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRecord {
    pub peer_id: String,
    pub ratio: f64,
    /// Oldest buffered value the ratio is applied to
    pub base_value: f64,
    /// Fraction of buffered samples matching `base_value * ratio`
    pub strength: f64,
    pub detected_at: u64,
}

/// Result of one detection pass, before it is attributed to a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub ratio: f64,
    pub base_value: f64,
    pub strength: f64,
}

impl From<Detection> for SharedPattern {
    fn from(d: Detection) -> Self {
        SharedPattern {
            ratio: d.ratio,
            base_value: d.base_value,
            strength: d.strength,
        }
    }
}

/// Test `values` against each candidate ratio in order.
///
/// Returns the first ratio whose match fraction exceeds the threshold, or
/// `None` if there are fewer than `min_samples` values or nothing matches.
pub fn detect_pattern(values: &[f64], config: &SignalConfig) -> Option<Detection> {
    if values.len() < config.min_samples.max(1) {
        return None;
    }
    let base_value = values[0];
    let total = values.len() as f64;

    config.ratios.iter().find_map(|&ratio| {
        let expected = base_value * ratio;
        let matches = values
            .iter()
            .filter(|v| (*v - expected).abs() <= config.tolerance)
            .count();
        let strength = matches as f64 / total;
        (strength > config.match_threshold).then_some(Detection {
            ratio,
            base_value,
            strength,
        })
    })
}

#[derive(Debug, Default)]
struct SignalHistory {
    entries: VecDeque<SignalHistoryEntry>,
    moving_average: f64,
    /// Ratio reported by the previous detection pass
    last_ratio: Option<f64>,
    /// Pattern the peer itself advertised
    shared: Option<SharedPattern>,
}

impl SignalHistory {
    fn push(&mut self, entry: SignalHistoryEntry, capacity: usize) {
        while self.entries.len() >= capacity.max(1) {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.recompute_average();
    }

    fn recompute_average(&mut self) {
        self.moving_average = if self.entries.is_empty() {
            0.0
        } else {
            self.entries.iter().map(|e| e.value).sum::<f64>() / self.entries.len() as f64
        };
    }

    fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.value).collect()
    }
}

/// Signal histories for every tracked peer plus this node's own signal.
#[derive(Debug)]
pub struct SignalAnalyzer {
    config: SignalConfig,
    peers: HashMap<String, SignalHistory>,
    local: SignalHistory,
}

impl SignalAnalyzer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            local: SignalHistory::default(),
        }
    }

    /// Start tracking a peer. Called when its peer record is created.
    ///
    /// Returns false if the peer was already tracked (history is kept).
    pub fn track(&mut self, peer_id: &str) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        self.peers.insert(peer_id.to_string(), SignalHistory::default());
        true
    }

    /// Stop tracking a peer and drop its history.
    pub fn forget(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn is_tracked(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn tracked_peers(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// Record a signal value from a tracked peer.
    ///
    /// Returns a pattern record when detection finds a ratio that differs
    /// from the one found on the previous pass, so a stable pattern is
    /// reported once rather than on every sample. Observations for untracked
    /// peers are ignored.
    pub fn observe(&mut self, peer_id: &str, value: f64, received_at: u64) -> Option<PatternRecord> {
        let capacity = self.config.history_capacity;
        let history = self.peers.get_mut(peer_id)?;
        history.push(SignalHistoryEntry { value, received_at }, capacity);

        let detection = detect_pattern(&history.values(), &self.config);
        let ratio = detection.map(|d| d.ratio);
        if ratio == history.last_ratio {
            return None;
        }
        history.last_ratio = ratio;

        detection.map(|d| PatternRecord {
            peer_id: peer_id.to_string(),
            ratio: d.ratio,
            base_value: d.base_value,
            strength: d.strength,
            detected_at: received_at,
        })
    }

    /// Buffered history for a peer, oldest first.
    pub fn history(&self, peer_id: &str) -> Option<Vec<SignalHistoryEntry>> {
        self.peers
            .get(peer_id)
            .map(|h| h.entries.iter().copied().collect())
    }

    pub fn moving_average(&self, peer_id: &str) -> Option<f64> {
        self.peers.get(peer_id).map(|h| h.moving_average)
    }

    /// Record a value of this node's own signal.
    pub fn observe_local(&mut self, value: f64, at: u64) {
        let capacity = self.config.history_capacity;
        self.local.push(
            SignalHistoryEntry {
                value,
                received_at: at,
            },
            capacity,
        );
    }

    /// This node's derived signal: the mean of its own recent values.
    pub fn derived_signal(&self) -> f64 {
        self.local.moving_average
    }

    /// Pattern currently present in this node's own history.
    pub fn local_pattern(&self) -> Option<SharedPattern> {
        detect_pattern(&self.local.values(), &self.config).map(SharedPattern::from)
    }

    /// Distance between a peer's moving average and `reference`.
    ///
    /// `None` for untracked peers or peers with no samples yet.
    pub fn drift(&self, peer_id: &str, reference: f64) -> Option<f64> {
        let history = self.peers.get(peer_id)?;
        if history.entries.is_empty() {
            return None;
        }
        Some((history.moving_average - reference).abs())
    }

    /// Peers whose moving average is more than `threshold` away from
    /// `reference`, with their drift.
    pub fn drifting(&self, reference: f64, threshold: f64) -> Vec<(&str, f64)> {
        self.tracked_peers()
            .filter_map(|peer| Some((peer, self.drift(peer, reference)?)))
            .filter(|(_, drift)| *drift > threshold)
            .collect()
    }

    /// Remember the pattern a peer advertised about its own signal.
    pub fn record_shared(&mut self, peer_id: &str, pattern: SharedPattern) {
        if let Some(history) = self.peers.get_mut(peer_id) {
            history.shared = Some(pattern);
        }
    }

    pub fn shared_pattern(&self, peer_id: &str) -> Option<&SharedPattern> {
        self.peers.get(peer_id)?.shared.as_ref()
    }

    /// Short description of the analyzer state, folded into new identities.
    pub fn state_digest(&self) -> String {
        format!("signal:{}:{}", self.peers.len(), self.local.entries.len())
    }
}
