//! Building adapters from configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hsp_protocol::HspResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    BrokerTransport, FileTransport, FileTransportConfig, HttpTransport, HttpTransportConfig,
    MemoryBus, MemoryTransport, Transport, TransportKind,
};

fn default_memory_bus() -> String {
    "default".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_retention_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

/// One configured adapter. An unrecognised `type` fails deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSpec {
    Broker {
        #[serde(default)]
        name: Option<String>,
        address: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    Http {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        listen: Option<SocketAddr>,
        #[serde(default)]
        peers: Vec<String>,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    File {
        #[serde(default)]
        name: Option<String>,
        root: PathBuf,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "default_retention_secs")]
        retention_secs: u64,
    },
    Memory {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_memory_bus")]
        bus: String,
    },
}

impl TransportSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Broker { .. } => TransportKind::Primary,
            Self::Http { .. } => TransportKind::HttpFallback,
            Self::File { .. } => TransportKind::FileFallback,
            Self::Memory { .. } => TransportKind::MemoryFallback,
        }
    }

    /// Configured name, or `<kind>` when none was given.
    pub fn name(&self) -> String {
        let configured = match self {
            Self::Broker { name, .. }
            | Self::Http { name, .. }
            | Self::File { name, .. }
            | Self::Memory { name, .. } => name.clone(),
        };
        configured.unwrap_or_else(|| self.kind().to_string())
    }
}

/// Builds adapters, sharing in-process buses by name.
#[derive(Debug, Default, Clone)]
pub struct TransportFactory {
    buses: Arc<Mutex<HashMap<String, MemoryBus>>>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named in-process bus, created on first use.
    pub fn memory_bus(&self, name: &str) -> MemoryBus {
        self.buses
            .lock()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    pub fn build(&self, spec: &TransportSpec) -> HspResult<Arc<dyn Transport>> {
        let name = spec.name();
        let transport: Arc<dyn Transport> = match spec {
            TransportSpec::Broker {
                address,
                connect_timeout_ms,
                ..
            } => Arc::new(
                BrokerTransport::new(name, address.clone())
                    .with_connect_timeout(Duration::from_millis(*connect_timeout_ms)),
            ),
            TransportSpec::Http {
                listen,
                peers,
                request_timeout_ms,
                ..
            } => Arc::new(HttpTransport::new(
                name,
                HttpTransportConfig {
                    listen: *listen,
                    peers: peers.clone(),
                    request_timeout: Duration::from_millis(*request_timeout_ms),
                },
            )?),
            TransportSpec::File {
                root,
                poll_interval_ms,
                retention_secs,
                ..
            } => Arc::new(FileTransport::new(
                name,
                FileTransportConfig {
                    root: root.clone(),
                    poll_interval: Duration::from_millis(*poll_interval_ms),
                    retention: Duration::from_secs(*retention_secs),
                },
            )),
            TransportSpec::Memory { bus, .. } => {
                Arc::new(MemoryTransport::new(name, self.memory_bus(bus)))
            }
        };
        Ok(transport)
    }
}
