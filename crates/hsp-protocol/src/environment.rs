use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{AgentId, FactId};

/// A snapshot of some part of the shared environment, e.g. a sensor reading
/// or a workspace status, broadcast to interested agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalState {
    pub state_id: FactId,
    pub source_id: AgentId,
    pub domain: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}
