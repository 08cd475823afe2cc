//! Transport adapters for HSP.
//!
//! Every adapter moves opaque envelope bytes between a topic and the
//! subscribers whose filters match it. The fallback manager drives adapters
//! through the [`Transport`] trait only; nothing above it knows which wire is
//! in use.

use std::fmt;

use async_trait::async_trait;
use hsp_protocol::{HspError, HspResult, topics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

pub mod broker;
pub mod file;
pub mod http;
pub mod memory;
pub mod spec;

pub use broker::{BrokerFrame, BrokerServer, BrokerTransport};
pub use file::{FileTransport, FileTransportConfig};
pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::{MemoryBus, MemoryTransport};
pub use spec::{TransportFactory, TransportSpec};

/// Which role an adapter plays in the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Primary,
    HttpFallback,
    FileFallback,
    MemoryFallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Primary => "primary",
            Self::HttpFallback => "http_fallback",
            Self::FileFallback => "file_fallback",
            Self::MemoryFallback => "memory_fallback",
        };
        f.write_str(label)
    }
}

/// Bytes received on a topic, tagged with the adapter that carried them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub topic: String,
    pub bytes: Vec<u8>,
    pub via: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> HspResult<()>;
    async fn disconnect(&self) -> HspResult<()>;

    async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()>;

    /// Deliver frames whose topic matches `filter` into `inbound`.
    async fn subscribe(&self, filter: &str, inbound: mpsc::Sender<InboundFrame>)
    -> HspResult<()>;

    /// Cheap passive health view; must not block.
    fn is_healthy(&self) -> bool;

    /// Active health check. Adapters that can reconnect do so here.
    async fn probe(&self) -> bool {
        self.is_healthy()
    }
}

/// Filter -> inbound channel table shared by every adapter.
///
/// A frame is delivered at most once per channel even when several filters
/// registered on the same channel match its topic.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Mutex<Vec<(String, mpsc::Sender<InboundFrame>)>>,
}

impl SubscriptionTable {
    pub fn add(&self, filter: &str, inbound: mpsc::Sender<InboundFrame>) -> HspResult<()> {
        if !topics::is_valid_filter(filter) {
            return Err(HspError::Schema(format!("invalid topic filter: {filter}")));
        }
        let mut entries = self.entries.lock();
        let duplicate = entries
            .iter()
            .any(|(existing, sender)| existing == filter && sender.same_channel(&inbound));
        if !duplicate {
            entries.push((filter.to_owned(), inbound));
        }
        Ok(())
    }

    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .entries
            .lock()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn targets(&self, topic: &str) -> Vec<mpsc::Sender<InboundFrame>> {
        let entries = self.entries.lock();
        let mut targets: Vec<mpsc::Sender<InboundFrame>> = Vec::new();
        for (filter, sender) in entries.iter() {
            if topics::matches(filter, topic)
                && !targets.iter().any(|known| known.same_channel(sender))
            {
                targets.push(sender.clone());
            }
        }
        targets
    }

    /// Push a frame to every matching channel, waiting for capacity.
    /// Returns how many channels received it.
    pub async fn dispatch(&self, frame: InboundFrame) -> usize {
        let targets = self.targets(&frame.topic);
        let mut delivered = 0;
        for target in targets {
            if target.send(frame.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.entries
                    .lock()
                    .retain(|(_, sender)| !sender.same_channel(&target));
                debug!(topic = %frame.topic, "dropped closed subscriber channel");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(topic: &str) -> InboundFrame {
        InboundFrame {
            topic: topic.to_owned(),
            bytes: b"{}".to_vec(),
            via: "test".to_owned(),
        }
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once_per_channel() {
        let table = SubscriptionTable::default();
        let (tx, mut rx) = mpsc::channel(8);
        table.add("hsp/knowledge/#", tx.clone()).unwrap();
        table.add("hsp/knowledge/facts/+", tx).unwrap();

        assert_eq!(table.dispatch(frame("hsp/knowledge/facts/a")).await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_channels_are_pruned() {
        let table = SubscriptionTable::default();
        let (tx, rx) = mpsc::channel(8);
        table.add("hsp/#", tx).unwrap();
        drop(rx);
        assert_eq!(table.dispatch(frame("hsp/acks/a")).await, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn rejects_malformed_filters() {
        let table = SubscriptionTable::default();
        let (tx, _rx) = mpsc::channel(1);
        assert!(table.add("hsp/#/facts", tx).is_err());
    }
}
