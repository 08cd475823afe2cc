//! The versioned HSP message envelope.
//!
//! Every message on every transport is one JSON-encoded [`Envelope`]. The
//! payload is carried as raw JSON and interpreted through its
//! [`MessageType`], which embeds the payload version (`HSP::Fact_v0.1`).
//!
//! Forward-compatible: unknown top-level fields land in
//! [`Envelope::extensions`] and are written back out on encode.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{HspError, HspResult};
use crate::ids::{AgentId, MessageId};

/// Envelope layout version written by this crate.
pub const ENVELOPE_VERSION: &str = "0.1";
/// HSP protocol version written by this crate.
pub const PROTOCOL_VERSION: &str = "0.1.0";
/// Namespace of all built-in message types.
pub const HSP_NAMESPACE: &str = "HSP";
/// Payload version of all built-in message types.
pub const PAYLOAD_VERSION: &str = "0.1";

/// Communication pattern of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Publish,
    Request,
    Response,
    Stream,
}

/// Delivery priority hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Quality-of-service parameters attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl Qos {
    pub fn acknowledged() -> Self {
        Self {
            requires_ack: true,
            ..Self::default()
        }
    }
}

/// Built-in payload families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Fact,
    Belief,
    Opinion,
    CapabilityAdvertisement,
    TaskRequest,
    TaskResult,
    Acknowledgement,
    NegativeAcknowledgement,
    EnvironmentalState,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 9] = [
        PayloadKind::Fact,
        PayloadKind::Belief,
        PayloadKind::Opinion,
        PayloadKind::CapabilityAdvertisement,
        PayloadKind::TaskRequest,
        PayloadKind::TaskResult,
        PayloadKind::Acknowledgement,
        PayloadKind::NegativeAcknowledgement,
        PayloadKind::EnvironmentalState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Fact => "Fact",
            Self::Belief => "Belief",
            Self::Opinion => "Opinion",
            Self::CapabilityAdvertisement => "CapabilityAdvertisement",
            Self::TaskRequest => "TaskRequest",
            Self::TaskResult => "TaskResult",
            Self::Acknowledgement => "Acknowledgement",
            Self::NegativeAcknowledgement => "NegativeAcknowledgement",
            Self::EnvironmentalState => "EnvironmentalState",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// Namespaced, versioned message type such as `HSP::Fact_v0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageType {
    namespace: String,
    name: String,
    version: String,
}

impl MessageType {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Built-in `HSP::<Kind>_v0.1` type.
    pub fn hsp(kind: PayloadKind) -> Self {
        Self::new(HSP_NAMESPACE, kind.name(), PAYLOAD_VERSION)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `HSP::Fact`: the type without its version suffix.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }

    pub fn kind(&self) -> Option<PayloadKind> {
        if self.namespace != HSP_NAMESPACE {
            return None;
        }
        PayloadKind::from_name(&self.name)
    }

    pub fn is(&self, kind: PayloadKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Matches either the exact `HSP::Fact_v0.1` form or the unversioned
    /// `HSP::Fact` form.
    pub fn matches_selector(&self, selector: &str) -> bool {
        selector == self.to_string() || selector == self.qualified_name()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}_v{}", self.namespace, self.name, self.version)
    }
}

impl FromStr for MessageType {
    type Err = HspError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (namespace, rest) = raw
            .split_once("::")
            .ok_or_else(|| HspError::Schema(format!("message_type lacks namespace: {raw}")))?;
        let (name, version) = rest
            .rsplit_once("_v")
            .ok_or_else(|| HspError::Schema(format!("message_type lacks version: {raw}")))?;
        if namespace.is_empty() || name.is_empty() || version.is_empty() {
            return Err(HspError::Schema(format!("malformed message_type: {raw}")));
        }
        Ok(Self::new(namespace, name, version))
    }
}

impl TryFrom<String> for MessageType {
    type Error = HspError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.to_string()
    }
}

/// The outer wrapper around every HSP payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_version: String,
    pub message_id: MessageId,
    pub sender_id: AgentId,
    /// Agent id or topic string.
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    pub message_type: MessageType,
    pub protocol_version: String,
    pub pattern: Pattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema_uri: Option<String>,
    pub payload: Value,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl Envelope {
    pub fn requires_ack(&self) -> bool {
        self.qos.as_ref().is_some_and(|qos| qos.requires_ack)
    }

    /// True when `ttl_seconds` is set and `now` lies past `sent_at + ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.qos.as_ref().and_then(|qos| qos.ttl_seconds) {
            Some(ttl) => {
                let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
                (now - self.sent_at).num_seconds() > ttl
            }
            None => false,
        }
    }

    /// Deserialize the payload into a typed body.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> HspResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|error| {
            HspError::Schema(format!("invalid {} payload: {error}", self.message_type))
        })
    }
}

/// An envelope that may still lack `message_id` / `sent_at`.
///
/// The codec turns a draft into an [`Envelope`] via `seal`, filling the
/// missing fields only when the caller passes [`FillPolicy::FillMissing`].
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    pub message_id: Option<MessageId>,
    pub sender_id: AgentId,
    pub recipient: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_type: MessageType,
    pub pattern: Pattern,
    pub correlation_id: Option<MessageId>,
    pub qos: Option<Qos>,
    pub payload_schema_uri: Option<String>,
    pub payload: Value,
}

impl EnvelopeDraft {
    pub fn new(
        sender_id: AgentId,
        recipient: impl Into<String>,
        message_type: MessageType,
        pattern: Pattern,
        payload: Value,
    ) -> Self {
        Self {
            message_id: None,
            sender_id,
            recipient: recipient.into(),
            sent_at: None,
            message_type,
            pattern,
            correlation_id: None,
            qos: None,
            payload_schema_uri: None,
            payload,
        }
    }

    /// Build a draft from any serializable payload body.
    pub fn for_payload<T: Serialize>(
        sender_id: AgentId,
        recipient: impl Into<String>,
        kind: PayloadKind,
        pattern: Pattern,
        payload: &T,
    ) -> HspResult<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|error| HspError::Schema(format!("payload not serializable: {error}")))?;
        Ok(Self::new(
            sender_id,
            recipient,
            MessageType::hsp(kind),
            pattern,
            payload,
        ))
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_qos(mut self, qos: Option<Qos>) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_schema_uri(mut self, uri: impl Into<String>) -> Self {
        self.payload_schema_uri = Some(uri.into());
        self
    }
}

/// Whether sealing a draft may fill absent `message_id` / `sent_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Missing fields are a schema error.
    Strict,
    /// Mint a fresh `message_id` and stamp `sent_at` from the clock.
    FillMissing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_parses_namespace_name_and_version() {
        let parsed: MessageType = "HSP::TaskRequest_v0.1".parse().unwrap();
        assert_eq!(parsed.namespace(), "HSP");
        assert_eq!(parsed.name(), "TaskRequest");
        assert_eq!(parsed.version(), "0.1");
        assert_eq!(parsed.kind(), Some(PayloadKind::TaskRequest));
        assert_eq!(parsed.to_string(), "HSP::TaskRequest_v0.1");
    }

    #[test]
    fn message_type_rejects_missing_version() {
        let err = "HSP::Fact".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, HspError::Schema(_)));
    }

    #[test]
    fn message_type_selector_accepts_unversioned_form() {
        let ty = MessageType::hsp(PayloadKind::Fact);
        assert!(ty.matches_selector("HSP::Fact"));
        assert!(ty.matches_selector("HSP::Fact_v0.1"));
        assert!(!ty.matches_selector("HSP::Belief"));
    }

    #[test]
    fn custom_namespace_has_no_builtin_kind() {
        let ty: MessageType = "Acme::Fact_v2".parse().unwrap();
        assert_eq!(ty.kind(), None);
    }

    #[test]
    fn pattern_and_priority_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Pattern::Request).unwrap(), "\"request\"");
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }

    #[test]
    fn ttl_expiry_uses_sent_at() {
        let sent_at = Utc::now() - chrono::Duration::seconds(30);
        let envelope = Envelope {
            envelope_version: ENVELOPE_VERSION.to_owned(),
            message_id: MessageId::generate(),
            sender_id: AgentId::from("a"),
            recipient: "hsp/knowledge/facts/a".to_owned(),
            sent_at,
            message_type: MessageType::hsp(PayloadKind::Fact),
            protocol_version: PROTOCOL_VERSION.to_owned(),
            pattern: Pattern::Publish,
            correlation_id: None,
            qos: Some(Qos {
                ttl_seconds: Some(10),
                ..Qos::default()
            }),
            payload_schema_uri: None,
            payload: Value::Null,
            extensions: Map::new(),
        };
        assert!(envelope.is_expired(Utc::now()));
        assert!(!envelope.is_expired(sent_at));
    }
}
