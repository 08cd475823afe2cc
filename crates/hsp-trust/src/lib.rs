//! Per-peer trust scores.
//!
//! Each peer starts at a neutral score and moves toward 1.0 or 0.0 with an
//! exponential moving average over interaction outcomes. The score scales
//! the confidence of every fact the peer publishes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hsp_protocol::{AgentId, Fact};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Score assumed for peers with no history.
    pub neutral: f64,
    /// Weight of the newest outcome in the moving average.
    pub alpha: f64,
    /// Initial scores for known peers.
    pub seeds: HashMap<AgentId, f64>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            neutral: 0.5,
            alpha: 0.1,
            seeds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub peer_id: AgentId,
    pub score: f64,
    pub successes: u64,
    pub failures: u64,
    pub messages_seen: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl TrustRecord {
    fn new(peer_id: AgentId, score: f64) -> Self {
        Self {
            peer_id,
            score,
            successes: 0,
            failures: 0,
            messages_seen: 0,
            last_seen: None,
        }
    }
}

#[derive(Debug)]
pub struct TrustManager {
    neutral: f64,
    alpha: f64,
    records: Mutex<HashMap<AgentId, TrustRecord>>,
}

impl Default for TrustManager {
    fn default() -> Self {
        Self::new(TrustConfig::default())
    }
}

impl TrustManager {
    pub fn new(config: TrustConfig) -> Self {
        let manager = Self {
            neutral: config.neutral.clamp(0.0, 1.0),
            alpha: config.alpha.clamp(0.0, 1.0),
            records: Mutex::new(HashMap::new()),
        };
        for (peer, score) in config.seeds {
            manager.seed(peer, score);
        }
        manager
    }

    pub fn neutral(&self) -> f64 {
        self.neutral
    }

    pub fn score(&self, peer: &AgentId) -> f64 {
        self.records
            .lock()
            .get(peer)
            .map_or(self.neutral, |record| record.score)
    }

    /// Fold one interaction outcome into the peer's score and return the new
    /// score.
    #[instrument(skip(self), fields(peer = %peer))]
    pub fn record_outcome(&self, peer: &AgentId, success: bool) -> f64 {
        let outcome = if success { 1.0 } else { 0.0 };
        let mut records = self.records.lock();
        let record = records
            .entry(peer.clone())
            .or_insert_with(|| TrustRecord::new(peer.clone(), self.neutral));
        record.score = (record.score * (1.0 - self.alpha) + outcome * self.alpha).clamp(0.0, 1.0);
        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }
        debug!(score = record.score, "trust updated");
        record.score
    }

    /// Count an inbound message from `peer` without touching its score.
    pub fn note_seen(&self, peer: &AgentId, at: DateTime<Utc>) {
        let mut records = self.records.lock();
        let record = records
            .entry(peer.clone())
            .or_insert_with(|| TrustRecord::new(peer.clone(), self.neutral));
        record.messages_seen += 1;
        record.last_seen = Some(record.last_seen.map_or(at, |previous| previous.max(at)));
    }

    /// Set a peer's score directly, e.g. from configuration.
    pub fn seed(&self, peer: AgentId, score: f64) {
        let score = score.clamp(0.0, 1.0);
        self.records
            .lock()
            .entry(peer.clone())
            .and_modify(|record| record.score = score)
            .or_insert_with(|| TrustRecord::new(peer, score));
    }

    /// `fact.confidence * score(fact.source_id)`.
    pub fn effective_confidence(&self, fact: &Fact) -> f64 {
        fact.bounded_confidence() * self.score(&fact.source_id)
    }

    pub fn record(&self, peer: &AgentId) -> Option<TrustRecord> {
        self.records.lock().get(peer).cloned()
    }

    pub fn snapshot(&self) -> Vec<TrustRecord> {
        let mut records: Vec<TrustRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }
}
