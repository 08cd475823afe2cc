//! Registry of capabilities advertised by peers.
//!
//! Entries are keyed by `(agent_id, capability_id)` and live for `ttl` after
//! their last advertisement. Expired entries are invisible to discovery at
//! once and are physically removed by the sweeper, which is the only path
//! that deletes anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hsp_protocol::{
    AgentId, CapabilityAdvertisement, CapabilityId, Clock, ErrorCode, HspError, HspResult,
};
use hsp_trust::TrustManager;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl RegistryConfig {
    /// Longest accepted TTL: one year.
    pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

    pub fn validate(&self) -> HspResult<()> {
        if self.ttl_secs == 0 {
            return Err(HspError::Config("registry ttl must be positive".to_owned()));
        }
        if self.ttl_secs > Self::MAX_TTL_SECS {
            return Err(HspError::Config(format!(
                "registry ttl {}s exceeds the maximum of {}s",
                self.ttl_secs,
                Self::MAX_TTL_SECS
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Filter for [`CapabilityRegistry::discover`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryQuery {
    pub name: Option<String>,
    pub capability_id: Option<CapabilityId>,
    pub agent_id: Option<AgentId>,
    /// Matches ads sharing at least one tag. `None` or empty disables it.
    pub tags: Option<Vec<String>>,
    pub min_trust: f64,
}

impl DiscoveryQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_min_trust(mut self, min_trust: f64) -> Self {
        self.min_trust = min_trust;
        self
    }

    fn matches(&self, ad: &CapabilityAdvertisement) -> bool {
        self.name.as_ref().is_none_or(|name| &ad.name == name)
            && self
                .capability_id
                .as_ref()
                .is_none_or(|id| &ad.capability_id == id)
            && self.agent_id.as_ref().is_none_or(|id| &ad.agent_id == id)
            && self
                .tags
                .as_ref()
                .is_none_or(|tags| tags.is_empty() || ad.has_any_tag(tags))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advertised {
    Inserted,
    Refreshed,
}

#[derive(Debug, Clone)]
struct Entry {
    ad: CapabilityAdvertisement,
    refreshed_at: DateTime<Utc>,
    seq: u64,
}

pub struct CapabilityRegistry {
    ttl: chrono::Duration,
    sweep_interval: Duration,
    trust: Arc<TrustManager>,
    clock: Arc<dyn Clock>,
    entries: Mutex<IndexMap<(AgentId, CapabilityId), Entry>>,
    seq: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityRegistry {
    /// Fails with a config error when the TTL is zero or out of range.
    pub fn new(
        config: RegistryConfig,
        trust: Arc<TrustManager>,
        clock: Arc<dyn Clock>,
    ) -> HspResult<Self> {
        config.validate()?;
        let ttl = i64::try_from(config.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                HspError::Config(format!("registry ttl {}s is out of range", config.ttl_secs))
            })?;
        Ok(Self {
            ttl,
            sweep_interval: config.sweep_interval(),
            trust,
            clock,
            entries: Mutex::new(IndexMap::new()),
            seq: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        })
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    fn is_expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.refreshed_at > self.ttl
    }

    /// Insert or refresh an advertisement and restart its staleness timer.
    #[instrument(skip(self, ad), fields(agent = %ad.agent_id, capability = %ad.capability_id))]
    pub fn advertise(&self, ad: CapabilityAdvertisement) -> Advertised {
        let key = (ad.agent_id.clone(), ad.capability_id.clone());
        let entry = Entry {
            ad,
            refreshed_at: self.clock.now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let outcome = match self.entries.lock().insert(key, entry) {
            Some(_) => Advertised::Refreshed,
            None => Advertised::Inserted,
        };
        debug!(?outcome, "capability advertised");
        outcome
    }

    pub fn get(
        &self,
        agent_id: &AgentId,
        capability_id: &CapabilityId,
    ) -> Option<CapabilityAdvertisement> {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(&(agent_id.clone(), capability_id.clone()))
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.ad.clone())
    }

    /// Online, unexpired ads matching `query` whose agent meets
    /// `min_trust`, best-trusted first and most recently refreshed next.
    pub fn discover(&self, query: &DiscoveryQuery) -> Vec<CapabilityAdvertisement> {
        let now = self.clock.now();
        let candidates: Vec<Entry> = self
            .entries
            .lock()
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .filter(|entry| entry.ad.is_online() && query.matches(&entry.ad))
            .cloned()
            .collect();

        let total = candidates.len();
        let mut trusted: Vec<(f64, Entry)> = candidates
            .into_iter()
            .map(|entry| (self.trust.score(&entry.ad.agent_id), entry))
            .filter(|(score, _)| *score >= query.min_trust)
            .collect();

        if total > 0 && trusted.is_empty() {
            debug!(
                code = ErrorCode::TrustRejected.as_str(),
                candidates = total,
                min_trust = query.min_trust,
                "every matching capability was below the trust threshold"
            );
        }

        trusted.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| b.refreshed_at.cmp(&a.refreshed_at))
                .then_with(|| b.seq.cmp(&a.seq))
        });
        trusted.into_iter().map(|(_, entry)| entry.ad).collect()
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.refreshed_at <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "expired capabilities swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn close(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl Drop for CapabilityRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use hsp_protocol::{Availability, ManualClock};

    use super::*;

    struct Fixture {
        clock: Arc<ManualClock>,
        trust: Arc<TrustManager>,
        registry: Arc<CapabilityRegistry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let trust = Arc::new(TrustManager::default());
        let registry = Arc::new(CapabilityRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&trust),
            clock.clone(),
        )
        .unwrap());
        Fixture {
            clock,
            trust,
            registry,
        }
    }

    fn calculator(agent: &str) -> CapabilityAdvertisement {
        CapabilityAdvertisement::new("calc-1", agent, "calculator", "1.0").with_tags(["math"])
    }

    #[test]
    fn discovers_advertised_capability_by_tag() {
        let f = fixture();
        assert_eq!(f.registry.advertise(calculator("A")), Advertised::Inserted);

        let found = f
            .registry
            .discover(&DiscoveryQuery::default().with_tags(["math", "physics"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].capability_id.as_str(), "calc-1");

        let none = f
            .registry
            .discover(&DiscoveryQuery::default().with_tags(["poetry"]));
        assert!(none.is_empty());
    }

    #[test]
    fn readvertising_refreshes_instead_of_duplicating() {
        let f = fixture();
        f.registry.advertise(calculator("A"));
        f.clock.advance(chrono::Duration::seconds(200));
        assert_eq!(f.registry.advertise(calculator("A")), Advertised::Refreshed);
        assert_eq!(f.registry.len(), 1);

        f.clock.advance(chrono::Duration::seconds(200));
        assert_eq!(f.registry.discover(&DiscoveryQuery::default()).len(), 1);
    }

    #[test]
    fn stale_entries_vanish_before_and_after_sweep() {
        let f = fixture();
        f.registry.advertise(calculator("A"));
        f.clock.advance(chrono::Duration::seconds(301));

        assert!(f.registry.discover(&DiscoveryQuery::default()).is_empty());
        assert!(f.registry.get(&AgentId::from("A"), &CapabilityId::from("calc-1")).is_none());
        assert_eq!(f.registry.len(), 1);

        assert_eq!(f.registry.sweep(), 1);
        assert!(f.registry.is_empty());
    }

    #[test]
    fn offline_capabilities_are_not_discovered() {
        let f = fixture();
        let mut ad = calculator("A");
        ad.availability = Availability::Maintenance;
        f.registry.advertise(ad);
        assert!(f.registry.discover(&DiscoveryQuery::default()).is_empty());
    }

    #[test]
    fn discovery_filters_and_orders_by_trust() {
        let f = fixture();
        f.trust.seed(AgentId::from("low"), 0.2);
        f.trust.seed(AgentId::from("high"), 0.9);
        f.registry.advertise(calculator("low"));
        f.registry.advertise(calculator("mid"));
        f.registry.advertise(calculator("high"));

        let ranked: Vec<String> = f
            .registry
            .discover(&DiscoveryQuery::by_name("calculator"))
            .into_iter()
            .map(|ad| ad.agent_id.as_str().to_owned())
            .collect();
        assert_eq!(ranked, vec!["high", "mid", "low"]);

        let trusted = f
            .registry
            .discover(&DiscoveryQuery::by_name("calculator").with_min_trust(0.5));
        assert_eq!(trusted.len(), 2);

        let rejected = f
            .registry
            .discover(&DiscoveryQuery::by_name("calculator").with_min_trust(0.95));
        assert!(rejected.is_empty());
    }

    #[test]
    fn equal_trust_prefers_most_recent_refresh() {
        let f = fixture();
        f.registry.advertise(calculator("first"));
        f.clock.advance(chrono::Duration::seconds(5));
        f.registry.advertise(calculator("second"));

        let found = f.registry.discover(&DiscoveryQuery::default());
        assert_eq!(found[0].agent_id.as_str(), "second");
    }

    #[test]
    fn out_of_range_ttl_is_a_config_error() {
        for ttl_secs in [0, RegistryConfig::MAX_TTL_SECS + 1, 100_000_000_000_000_000] {
            let config = RegistryConfig {
                ttl_secs,
                ..RegistryConfig::default()
            };
            let error = CapabilityRegistry::new(
                config,
                Arc::new(TrustManager::default()),
                Arc::new(ManualClock::default()),
            )
            .err()
            .map(|error| error.code());
            assert_eq!(error, Some(ErrorCode::Config), "ttl_secs = {ttl_secs}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_its_own_timer() {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(CapabilityRegistry::new(
            RegistryConfig {
                ttl_secs: 10,
                sweep_interval_secs: 1,
            },
            Arc::new(TrustManager::default()),
            clock.clone(),
        )
        .unwrap());
        registry.advertise(calculator("A"));
        registry.start_sweeper();

        clock.advance(chrono::Duration::seconds(11));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(registry.is_empty());
        registry.close();
    }
}
