//! Agent configuration file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use hsp_conflict::ConflictConfig;
use hsp_fallback::FallbackPolicy;
use hsp_protocol::{AgentId, CapabilityAdvertisement, CapabilityId, HspError, HspResult};
use hsp_registry::RegistryConfig;
use hsp_transport::TransportSpec;
use hsp_trust::TrustConfig;
use serde::{Deserialize, Serialize};

/// Tuning knobs of the connector itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    /// Used when a task request carries no deadline.
    pub request_timeout_ms: u64,
    pub dispatch_buffer: usize,
    pub subscriber_buffer: usize,
    /// How many recent message ids are remembered for duplicate suppression.
    pub dedupe_capacity: usize,
    /// Hand the agent's own messages to its handlers.
    pub deliver_own: bool,
    /// Ask executors to acknowledge task requests.
    pub ack_requests: bool,
    /// Defaults to half the registry TTL.
    pub readvertise_interval_ms: Option<u64>,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            dispatch_buffer: 1_024,
            subscriber_buffer: 256,
            dedupe_capacity: 4_096,
            deliver_own: false,
            ack_requests: true,
            readvertise_interval_ms: None,
        }
    }
}

impl ConnectorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A capability this agent advertises on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub capability_id: CapabilityId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema_uri: Option<String>,
    #[serde(default)]
    pub output_schema_uri: Option<String>,
}

impl CapabilityConfig {
    pub fn advertisement(&self, agent_id: &AgentId) -> CapabilityAdvertisement {
        let mut ad = CapabilityAdvertisement::new(
            self.capability_id.clone(),
            agent_id.clone(),
            self.name.clone(),
            self.version.clone(),
        )
        .with_tags(self.tags.iter().cloned());
        ad.description = self.description.clone();
        ad.input_schema_uri = self.input_schema_uri.clone();
        ad.output_schema_uri = self.output_schema_uri.clone();
        ad
    }
}

/// Everything needed to run one agent.
///
/// `transports` is ordered by preference: the first entry gets priority 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub transports: Vec<TransportSpec>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub connector: ConnectorSettings,
    #[serde(default)]
    pub capabilities: Vec<CapabilityConfig>,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<AgentId>, transports: Vec<TransportSpec>) -> Self {
        Self {
            agent_id: agent_id.into(),
            transports,
            fallback: FallbackPolicy::default(),
            trust: TrustConfig::default(),
            registry: RegistryConfig::default(),
            conflict: ConflictConfig::default(),
            connector: ConnectorSettings::default(),
            capabilities: Vec::new(),
        }
    }

    pub fn from_json(raw: &str) -> HspResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| HspError::Config(format!("invalid agent config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> HspResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            HspError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> HspResult<()> {
        let id = self.agent_id.as_str();
        if self.agent_id.is_blank() {
            return Err(HspError::Config("agent_id must not be empty".to_owned()));
        }
        if id.contains(['/', '+', '#']) {
            return Err(HspError::Config(format!(
                "agent_id {id} must not contain topic separators or wildcards"
            )));
        }
        if self.transports.is_empty() {
            return Err(HspError::Config("at least one transport is required".to_owned()));
        }
        let mut names = HashSet::new();
        for spec in &self.transports {
            let name = spec.name();
            if !names.insert(name.clone()) {
                return Err(HspError::Config(format!("duplicate transport name {name}")));
            }
        }
        if self.fallback.demote_after == 0 || self.fallback.promote_after == 0 {
            return Err(HspError::Config(
                "fallback thresholds must be at least 1".to_owned(),
            ));
        }
        self.registry.validate()
    }

    pub fn advertisements(&self) -> Vec<CapabilityAdvertisement> {
        self.capabilities
            .iter()
            .map(|capability| capability.advertisement(&self.agent_id))
            .collect()
    }
}
