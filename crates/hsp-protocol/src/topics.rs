//! Hierarchical topic naming: `hsp/{domain}/{subdomain}/{focus}`.
//!
//! Topic filters follow MQTT conventions: `+` matches exactly one level,
//! a trailing `#` matches any number of remaining levels (including none).

use crate::envelope::PayloadKind;
use crate::ids::AgentId;

pub const ROOT: &str = "hsp";

pub const ALL_FACTS: &str = "hsp/knowledge/facts/#";
pub const ALL_BELIEFS: &str = "hsp/knowledge/beliefs/#";
pub const ALL_OPINIONS: &str = "hsp/knowledge/opinions/#";
pub const ALL_CAPABILITY_ADVERTISEMENTS: &str = "hsp/capabilities/advertisements/#";
pub const ALL_ENVIRONMENT_STATE: &str = "hsp/environment/state/#";
pub const GENERAL_FACTS: &str = "hsp/knowledge/facts/general";

pub fn facts(agent: &AgentId) -> String {
    format!("hsp/knowledge/facts/{agent}")
}

pub fn beliefs(agent: &AgentId) -> String {
    format!("hsp/knowledge/beliefs/{agent}")
}

pub fn opinions(agent: &AgentId) -> String {
    format!("hsp/knowledge/opinions/{agent}")
}

pub fn capability_advertisements(agent: &AgentId) -> String {
    format!("hsp/capabilities/advertisements/{agent}")
}

pub fn requests(agent: &AgentId) -> String {
    format!("hsp/requests/{agent}")
}

pub fn results(agent: &AgentId) -> String {
    format!("hsp/results/{agent}")
}

pub fn acks(agent: &AgentId) -> String {
    format!("hsp/acks/{agent}")
}

pub fn environment_state(agent: &AgentId) -> String {
    format!("hsp/environment/state/{agent}")
}

/// Default publication topic for a payload kind sent by `sender`.
pub fn default_topic(kind: PayloadKind, sender: &AgentId) -> String {
    match kind {
        PayloadKind::Fact => facts(sender),
        PayloadKind::Belief => beliefs(sender),
        PayloadKind::Opinion => opinions(sender),
        PayloadKind::CapabilityAdvertisement => capability_advertisements(sender),
        PayloadKind::EnvironmentalState => environment_state(sender),
        PayloadKind::TaskRequest => requests(sender),
        PayloadKind::TaskResult => results(sender),
        PayloadKind::Acknowledgement | PayloadKind::NegativeAcknowledgement => acks(sender),
    }
}

/// Resolve a recipient argument that is either a topic or an agent id.
pub fn route(target_or_topic: &str, by_agent: impl FnOnce(&AgentId) -> String) -> String {
    if is_topic(target_or_topic) {
        target_or_topic.to_owned()
    } else {
        by_agent(&AgentId::from(target_or_topic))
    }
}

pub fn is_topic(value: &str) -> bool {
    value.contains('/')
}

/// A concrete topic must be non-empty, free of wildcards and empty levels.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic
            .split('/')
            .all(|level| !level.is_empty() && !level.contains(['+', '#']))
}

/// A filter may use `+` as a whole level and `#` only as the last level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(index, level)| match *level {
        "#" => index == levels.len() - 1,
        "+" => true,
        other => !other.is_empty() && !other.contains(['+', '#']),
    })
}

/// MQTT-style filter match.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
