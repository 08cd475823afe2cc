//! # hsp-protocol: the HSP wire contract
//!
//! Shared types for the Heterogeneous Synchronization Protocol. Every other
//! HSP crate depends on this one; it carries no runtime dependencies (no
//! tokio, no network stack) so it can be embedded anywhere.
//!
//! ## Module Overview
//!
//! - [`ids`]: typed id wrappers (MessageId, AgentId, RequestId, ...)
//! - [`envelope`]: Envelope, MessageType, QoS, drafts and fill policy
//! - [`codec`]: JSON encode/decode with layered error reporting
//! - [`knowledge`]: Fact, Belief, Opinion
//! - [`capability`]: CapabilityAdvertisement
//! - [`task`]: TaskRequest, TaskResult
//! - [`ack`]: ACK / NACK payloads
//! - [`environment`]: EnvironmentalState
//! - [`topics`]: topic naming and MQTT-style filter matching
//! - [`ports`]: clock, metrics and persistence hooks
//! - [`error`]: HspError, ErrorCode, HspResult

pub mod ack;
pub mod capability;
pub mod codec;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod ids;
pub mod knowledge;
pub mod ports;
pub mod task;
pub mod topics;

pub use ack::{Acknowledgement, NegativeAcknowledgement};
pub use capability::{Availability, CapabilityAdvertisement};
pub use codec::{Codec, PayloadRegistry, SalvagedHeader};
pub use envelope::{
    ENVELOPE_VERSION, Envelope, EnvelopeDraft, FillPolicy, HSP_NAMESPACE, MessageType,
    PAYLOAD_VERSION, PROTOCOL_VERSION, Pattern, PayloadKind, Priority, Qos,
};
pub use environment::EnvironmentalState;
pub use error::{ErrorCode, HspError, HspResult};
pub use ids::{AgentId, CapabilityId, FactId, MessageId, RequestId, ResultId};
pub use knowledge::{Belief, Fact, Opinion, Stance, Statement};
pub use ports::{
    Clock, FactSink, IngestedFact, IngestedKnowledge, ManualClock, MetricsSink, SystemClock,
    TracingMetrics,
};
pub use task::{TaskError, TaskRequest, TaskResult, TaskStatus};
