use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CapabilityId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Online,
    Offline,
    Degraded,
    Maintenance,
}

/// A named, versioned service an agent advertises as callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityAdvertisement {
    pub capability_id: CapabilityId,
    pub agent_id: AgentId,
    pub name: String,
    pub version: String,
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_uri: Option<String>,
}

impl CapabilityAdvertisement {
    pub fn new(
        capability_id: impl Into<CapabilityId>,
        agent_id: impl Into<AgentId>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            capability_id: capability_id.into(),
            agent_id: agent_id.into(),
            name: name.into(),
            version: version.into(),
            availability: Availability::Online,
            description: None,
            tags: Vec::new(),
            input_schema_uri: None,
            output_schema_uri: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_online(&self) -> bool {
        self.availability == Availability::Online
    }

    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|tag| self.tags.contains(tag))
    }
}
