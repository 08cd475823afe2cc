//! # hsp-connector: the HSP façade for agents
//!
//! [`Connector`] ties the protocol pieces together for one agent: it owns
//! the transports (through the fallback manager), decodes and dispatches
//! inbound envelopes, answers ACK requests, tracks outstanding task requests
//! and feeds the trust, registry and conflict components.
//!
//! ```text
//!   app ── publish_* / send_task_request ──► Connector ──► FallbackManager ──► transports
//!   app ◄── MessageHandler ◄── dispatch ◄── inbound frames ◄──────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod handler;
mod pending;
mod tracking;

pub use config::{AgentConfig, CapabilityConfig, ConnectorSettings};
pub use connector::{Connector, ConnectorBuilder};
pub use handler::{MessageHandler, Selector, SubscriptionId, handler_fn};
pub use hsp_registry::DiscoveryQuery;
pub use pending::PendingTask;
pub use tracking::DeliveryState;
