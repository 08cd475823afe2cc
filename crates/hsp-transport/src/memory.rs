//! In-process bus shared by connectors living in the same process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use hsp_protocol::{HspError, HspResult};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, instrument, warn};

use crate::{InboundFrame, SubscriptionTable, Transport, TransportKind};

#[derive(Debug, Clone)]
struct BusFrame {
    topic: String,
    bytes: Arc<[u8]>,
}

/// Broadcast hub every [`MemoryTransport`] on the same bus publishes into.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusFrame>,
    available: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Take the bus down (or bring it back) for every attached transport.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn publish(&self, frame: BusFrame) {
        let _ = self.sender.send(frame);
    }

    fn subscribe_stream(&self) -> BroadcastStream<BusFrame> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct MemoryTransport {
    name: String,
    bus: MemoryBus,
    subscriptions: Arc<SubscriptionTable>,
    connected: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>, bus: MemoryBus) -> Self {
        Self {
            name: name.into(),
            bus,
            subscriptions: Arc::new(SubscriptionTable::default()),
            connected: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::MemoryFallback
    }

    #[instrument(skip(self), fields(transport = %self.name))]
    async fn connect(&self) -> HspResult<()> {
        if !self.bus.is_available() {
            return Err(HspError::Transport("memory bus is unavailable".to_owned()));
        }
        let mut pump = self.pump.lock();
        if pump.is_none() {
            let mut stream = self.bus.subscribe_stream();
            let subscriptions = Arc::clone(&self.subscriptions);
            let bus = self.bus.clone();
            let via = self.name.clone();
            *pump = Some(tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(frame) if bus.is_available() => {
                            subscriptions
                                .dispatch(InboundFrame {
                                    topic: frame.topic,
                                    bytes: frame.bytes.to_vec(),
                                    via: via.clone(),
                                })
                                .await;
                        }
                        Ok(_) => {}
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(transport = %via, skipped, "memory bus subscriber lagged");
                        }
                    }
                }
            }));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> HspResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()> {
        if !self.is_healthy() {
            return Err(HspError::Transport(format!(
                "{} cannot publish: bus unavailable or not connected",
                self.name
            )));
        }
        self.bus.publish(BusFrame {
            topic: topic.to_owned(),
            bytes: Arc::from(bytes),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> HspResult<()> {
        self.subscriptions.add(filter, inbound)
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.bus.is_available()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn frames_reach_matching_subscribers_on_other_transports() -> Result<()> {
        let bus = MemoryBus::default();
        let a = MemoryTransport::new("mem-a", bus.clone());
        let b = MemoryTransport::new("mem-b", bus);
        a.connect().await?;
        b.connect().await?;

        let (tx, mut rx) = mpsc::channel(8);
        b.subscribe("hsp/knowledge/facts/#", tx).await?;
        a.publish("hsp/acks/x", b"ignored").await?;
        a.publish("hsp/knowledge/facts/a", b"fact").await?;

        let frame = timeout(Duration::from_secs(1), rx.recv()).await?;
        let frame = frame.ok_or_else(|| anyhow::anyhow!("channel closed"))?;
        assert_eq!(frame.topic, "hsp/knowledge/facts/a");
        assert_eq!(frame.bytes, b"fact");
        assert_eq!(frame.via, "mem-b");
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_bus_fails_publish_and_health() -> Result<()> {
        let bus = MemoryBus::default();
        let transport = MemoryTransport::new("mem", bus.clone());
        transport.connect().await?;
        assert!(transport.is_healthy());

        bus.set_available(false);
        assert!(!transport.is_healthy());
        assert!(!transport.probe().await);
        assert!(transport.publish("hsp/acks/a", b"x").await.is_err());

        bus.set_available(true);
        assert!(transport.probe().await);
        Ok(())
    }
}
