//! Envelope codec: JSON bytes <-> [`Envelope`].
//!
//! Decoding is layered: malformed JSON is a [`HspError::Decode`], missing or
//! mistyped envelope fields are a [`HspError::Schema`], and a
//! `message_type` whose `(type, version)` pair has no registered payload
//! decoder is a [`HspError::UnsupportedVersion`]. Versions are never coerced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ack::{Acknowledgement, NegativeAcknowledgement};
use crate::capability::CapabilityAdvertisement;
use crate::envelope::{
    ENVELOPE_VERSION, Envelope, EnvelopeDraft, FillPolicy, MessageType, PROTOCOL_VERSION,
    PayloadKind,
};
use crate::environment::EnvironmentalState;
use crate::error::{HspError, HspResult};
use crate::ids::{AgentId, MessageId};
use crate::knowledge::{Belief, Fact, Opinion};
use crate::ports::Clock;
use crate::task::{TaskRequest, TaskResult};

/// Fields every envelope must carry.
pub const REQUIRED_FIELDS: [&str; 9] = [
    "envelope_version",
    "message_id",
    "sender_id",
    "recipient",
    "sent_at",
    "message_type",
    "protocol_version",
    "pattern",
    "payload",
];

type PayloadDecoder = Arc<dyn Fn(&Value) -> HspResult<()> + Send + Sync>;

/// Registered payload decoders keyed by `(Namespace::Name, version)`.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<(String, String), PayloadDecoder>,
}

impl PayloadRegistry {
    /// Registry with every built-in `HSP::*_v0.1` payload.
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::default();
        registry.register::<Fact>(MessageType::hsp(PayloadKind::Fact));
        registry.register::<Belief>(MessageType::hsp(PayloadKind::Belief));
        registry.register::<Opinion>(MessageType::hsp(PayloadKind::Opinion));
        registry.register::<CapabilityAdvertisement>(MessageType::hsp(
            PayloadKind::CapabilityAdvertisement,
        ));
        registry.register::<TaskRequest>(MessageType::hsp(PayloadKind::TaskRequest));
        registry.register::<TaskResult>(MessageType::hsp(PayloadKind::TaskResult));
        registry.register::<Acknowledgement>(MessageType::hsp(PayloadKind::Acknowledgement));
        registry.register::<NegativeAcknowledgement>(MessageType::hsp(
            PayloadKind::NegativeAcknowledgement,
        ));
        registry.register::<EnvironmentalState>(MessageType::hsp(PayloadKind::EnvironmentalState));
        registry
    }

    /// Register a payload version validated by deserializing into `T`.
    pub fn register<T: DeserializeOwned + 'static>(&mut self, message_type: MessageType) {
        let label = message_type.to_string();
        self.insert(
            message_type,
            Arc::new(move |payload: &Value| {
                T::deserialize(payload)
                    .map(|_| ())
                    .map_err(|error| HspError::Schema(format!("invalid {label} payload: {error}")))
            }),
        );
    }

    /// Register a payload version whose body is accepted as opaque JSON.
    pub fn register_opaque(&mut self, message_type: MessageType) {
        self.insert(message_type, Arc::new(|_: &Value| Ok(())));
    }

    fn insert(&mut self, message_type: MessageType, decoder: PayloadDecoder) {
        let key = (
            message_type.qualified_name(),
            message_type.version().to_owned(),
        );
        self.decoders.insert(key, decoder);
    }

    pub fn supports(&self, message_type: &MessageType) -> bool {
        self.decoders.contains_key(&(
            message_type.qualified_name(),
            message_type.version().to_owned(),
        ))
    }

    pub fn validate(&self, message_type: &MessageType, payload: &Value) -> HspResult<()> {
        let key = (
            message_type.qualified_name(),
            message_type.version().to_owned(),
        );
        match self.decoders.get(&key) {
            Some(decoder) => decoder(payload),
            None => Err(HspError::UnsupportedVersion(format!(
                "no decoder registered for {message_type}"
            ))),
        }
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .decoders
            .keys()
            .map(|(name, version)| format!("{name}_v{version}"))
            .collect();
        keys.sort();
        f.debug_struct("PayloadRegistry")
            .field("types", &keys)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Codec {
    payloads: PayloadRegistry,
    envelope_versions: HashSet<String>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(PayloadRegistry::with_builtin_types())
    }
}

impl Codec {
    pub fn new(payloads: PayloadRegistry) -> Self {
        Self {
            payloads,
            envelope_versions: HashSet::from([ENVELOPE_VERSION.to_owned()]),
        }
    }

    pub fn payloads(&self) -> &PayloadRegistry {
        &self.payloads
    }

    pub fn encode(&self, envelope: &Envelope) -> HspResult<Vec<u8>> {
        self.validate(envelope)?;
        serde_json::to_vec(envelope)
            .map_err(|error| HspError::Schema(format!("envelope not serializable: {error}")))
    }

    pub fn decode(&self, bytes: &[u8]) -> HspResult<Envelope> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|error| HspError::Decode(format!("malformed envelope JSON: {error}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| HspError::Schema("envelope must be a JSON object".to_owned()))?;

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| object.get(*field).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(HspError::Schema(format!(
                "missing required envelope fields: {}",
                missing.join(", ")
            )));
        }

        if let Some(version) = object.get("envelope_version").and_then(Value::as_str)
            && !self.envelope_versions.contains(version)
        {
            return Err(HspError::UnsupportedVersion(format!(
                "envelope_version {version}"
            )));
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|error| HspError::Schema(format!("invalid envelope: {error}")))?;
        self.payloads
            .validate(&envelope.message_type, &envelope.payload)?;
        Ok(envelope)
    }

    /// Turn a draft into a full envelope.
    pub fn seal(
        &self,
        draft: EnvelopeDraft,
        policy: FillPolicy,
        clock: &dyn Clock,
    ) -> HspResult<Envelope> {
        let message_id = match (draft.message_id, policy) {
            (Some(id), _) if !id.is_blank() => id,
            (_, FillPolicy::FillMissing) => MessageId::generate(),
            (_, FillPolicy::Strict) => {
                return Err(HspError::Schema("message_id is required".to_owned()));
            }
        };
        let sent_at = match (draft.sent_at, policy) {
            (Some(at), _) => at,
            (None, FillPolicy::FillMissing) => clock.now(),
            (None, FillPolicy::Strict) => {
                return Err(HspError::Schema("sent_at is required".to_owned()));
            }
        };
        let envelope = Envelope {
            envelope_version: ENVELOPE_VERSION.to_owned(),
            message_id,
            sender_id: draft.sender_id,
            recipient: draft.recipient,
            sent_at,
            message_type: draft.message_type,
            protocol_version: PROTOCOL_VERSION.to_owned(),
            pattern: draft.pattern,
            correlation_id: draft.correlation_id,
            qos: draft.qos,
            payload_schema_uri: draft.payload_schema_uri,
            payload: draft.payload,
            extensions: Default::default(),
        };
        self.validate(&envelope)?;
        Ok(envelope)
    }

    fn validate(&self, envelope: &Envelope) -> HspResult<()> {
        let blank = [
            ("envelope_version", envelope.envelope_version.trim().is_empty()),
            ("message_id", envelope.message_id.is_blank()),
            ("sender_id", envelope.sender_id.is_blank()),
            ("recipient", envelope.recipient.trim().is_empty()),
            ("protocol_version", envelope.protocol_version.trim().is_empty()),
        ];
        let missing: Vec<&str> = blank
            .iter()
            .filter(|(_, is_blank)| *is_blank)
            .map(|(field, _)| *field)
            .collect();
        if !missing.is_empty() {
            return Err(HspError::Schema(format!(
                "missing required envelope fields: {}",
                missing.join(", ")
            )));
        }
        if !self.envelope_versions.contains(&envelope.envelope_version) {
            return Err(HspError::UnsupportedVersion(format!(
                "envelope_version {}",
                envelope.envelope_version
            )));
        }
        self.payloads
            .validate(&envelope.message_type, &envelope.payload)
    }
}

/// Header fields recovered from bytes that failed to decode, used to address
/// a NACK back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalvagedHeader {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub requires_ack: bool,
}

impl SalvagedHeader {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let message_id = value.get("message_id")?.as_str()?;
        let sender_id = value.get("sender_id")?.as_str()?;
        let requires_ack = value
            .get("qos")
            .and_then(|qos| qos.get("requires_ack"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            message_id: MessageId::from(message_id),
            sender_id: AgentId::from(sender_id),
            requires_ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Pattern, Qos};
    use crate::knowledge::Statement;
    use crate::ports::ManualClock;
    use serde_json::json;

    fn fact_envelope(codec: &Codec) -> Envelope {
        let fact = Fact::new(
            AgentId::from("A"),
            Statement::triple("sky", "color", json!("blue")),
            0.9,
        );
        let draft = EnvelopeDraft::for_payload(
            AgentId::from("A"),
            "hsp/knowledge/facts/A",
            PayloadKind::Fact,
            Pattern::Publish,
            &fact,
        )
        .unwrap()
        .with_qos(Some(Qos::acknowledged()));
        codec
            .seal(draft, FillPolicy::FillMissing, &ManualClock::default())
            .unwrap()
    }

    #[test]
    fn decode_inverts_encode_field_for_field() {
        let codec = Codec::default();
        let mut envelope = fact_envelope(&codec);
        envelope
            .extensions
            .insert("trace_id".to_owned(), json!("abc"));
        let bytes = codec.encode(&envelope).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn malformed_json_is_decode_error() {
        let err = Codec::default().decode(b"{not json").unwrap_err();
        assert!(matches!(err, HspError::Decode(_)));
    }

    #[test]
    fn missing_fields_are_schema_errors_listing_fields() {
        let err = Codec::default()
            .decode(br#"{"envelope_version":"0.1","sender_id":"A"}"#)
            .unwrap_err();
        match err {
            HspError::Schema(message) => {
                assert!(message.contains("message_id"));
                assert!(message.contains("payload"));
                assert!(!message.contains("sender_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_payload_version_is_rejected_not_coerced() {
        let codec = Codec::default();
        let envelope = fact_envelope(&codec);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["message_type"] = json!("HSP::Fact_v9.9");
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(matches!(err, HspError::UnsupportedVersion(_)));
    }

    #[test]
    fn custom_versions_decode_once_registered() {
        let mut payloads = PayloadRegistry::with_builtin_types();
        payloads.register_opaque("Acme::Telemetry_v2".parse().unwrap());
        let codec = Codec::new(payloads);
        let envelope = fact_envelope(&codec);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["message_type"] = json!("Acme::Telemetry_v2");
        value["payload"] = json!({"cpu": 0.4});
        let decoded = codec.decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded.message_type.name(), "Telemetry");
    }

    #[test]
    fn mistyped_payload_is_schema_error() {
        let codec = Codec::default();
        let envelope = fact_envelope(&codec);
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["payload"]["confidence"] = json!("very");
        let err = codec.decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, HspError::Schema(_)));
    }

    #[test]
    fn strict_seal_requires_id_and_timestamp() {
        let codec = Codec::default();
        let draft = EnvelopeDraft::new(
            AgentId::from("A"),
            "hsp/knowledge/facts/A",
            MessageType::hsp(PayloadKind::Acknowledgement),
            Pattern::Response,
            json!({"target_message_id": "m1", "acknowledged_at": "2024-01-01T00:00:00Z"}),
        );
        let err = codec
            .seal(draft.clone(), FillPolicy::Strict, &ManualClock::default())
            .unwrap_err();
        assert!(matches!(err, HspError::Schema(_)));

        let clock = ManualClock::default();
        let sealed = codec
            .seal(
                draft.with_message_id(MessageId::from("m2")),
                FillPolicy::FillMissing,
                &clock,
            )
            .unwrap();
        assert_eq!(sealed.message_id.as_str(), "m2");
        assert_eq!(sealed.sent_at, clock.now());
    }

    #[test]
    fn encode_rejects_blank_sender() {
        let codec = Codec::default();
        let mut envelope = fact_envelope(&codec);
        envelope.sender_id = AgentId::from("");
        let err = codec.encode(&envelope).unwrap_err();
        assert!(matches!(err, HspError::Schema(_)));
    }

    #[test]
    fn salvage_reads_header_from_undecodable_envelope() {
        let header = SalvagedHeader::from_bytes(
            br#"{"message_id":"m1","sender_id":"B","qos":{"requires_ack":true},"message_type":"HSP::Fact_v7"}"#,
        )
        .unwrap();
        assert_eq!(header.message_id.as_str(), "m1");
        assert!(header.requires_ack);
    }
}
