//! Primary pub/sub transport: a small topic broker over TCP.
//!
//! Both directions speak newline-delimited JSON [`BrokerFrame`]s. Clients
//! register MQTT-style filters; the broker forwards every `publish` to each
//! client holding a matching filter, the publisher included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hsp_protocol::{HspError, HspResult, topics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{InboundFrame, SubscriptionTable, Transport, TransportKind};

/// One line on a broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    Publish { topic: String, body: String },
    Deliver { topic: String, body: String },
    Ping,
    Pong,
}

impl BrokerFrame {
    pub fn to_line(&self) -> HspResult<Vec<u8>> {
        let mut line = serde_json::to_vec(self)
            .map_err(|error| HspError::Transport(format!("failed encoding broker frame: {error}")))?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> HspResult<Self> {
        serde_json::from_str(line)
            .map_err(|error| HspError::Decode(format!("bad broker frame: {error}")))
    }
}

struct BrokerClient {
    peer: SocketAddr,
    filters: Vec<String>,
    outbox: mpsc::Sender<BrokerFrame>,
}

type ClientTable = Arc<Mutex<HashMap<u64, BrokerClient>>>;

pub struct BrokerServer {
    listener: TcpListener,
    clients: ClientTable,
    next_client: AtomicU64,
    outbox_capacity: usize,
}

/// Running broker; dropping or shutting it down closes every connection.
pub struct BrokerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl BrokerServer {
    pub async fn bind(addr: SocketAddr) -> HspResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client: AtomicU64::new(1),
            outbox_capacity: 1024,
        })
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn local_addr(&self) -> HspResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> HspResult<()> {
        info!(listen = %self.local_addr()?, "hsp broker listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let id = self.next_client.fetch_add(1, Ordering::Relaxed);
                    let clients = Arc::clone(&self.clients);
                    let capacity = self.outbox_capacity;
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_client(id, peer, stream, clients, capacity, shutdown));
                }
            }
        }
        info!("hsp broker stopped");
        Ok(())
    }

    pub fn spawn(self) -> HspResult<BrokerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(error) = self.run(receiver).await {
                warn!(%error, "hsp broker exited with error");
            }
        });
        Ok(BrokerHandle {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[instrument(skip(stream, clients, shutdown), fields(client = id, peer = %peer))]
async fn serve_client(
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    clients: ClientTable,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let (outbox, mut outbox_rx) = mpsc::channel::<BrokerFrame>(capacity);
    clients.lock().insert(
        id,
        BrokerClient {
            peer,
            filters: Vec::new(),
            outbox: outbox.clone(),
        },
    );
    debug!("broker client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let Ok(line) = frame.to_line() else {
                continue;
            };
            if write.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => handle_client_frame(id, &line, &clients, &outbox).await,
                    Ok(None) => break,
                    Err(error) => {
                        debug!(%error, "broker client read failed");
                        break;
                    }
                }
            }
        }
    }

    clients.lock().remove(&id);
    writer.abort();
    debug!("broker client disconnected");
}

async fn handle_client_frame(
    id: u64,
    line: &str,
    clients: &ClientTable,
    outbox: &mpsc::Sender<BrokerFrame>,
) {
    let frame = match BrokerFrame::parse(line) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(client = id, %error, "dropping malformed broker frame");
            return;
        }
    };
    match frame {
        BrokerFrame::Subscribe { filter } => {
            if !topics::is_valid_filter(&filter) {
                warn!(client = id, %filter, "rejecting invalid filter");
                return;
            }
            if let Some(client) = clients.lock().get_mut(&id)
                && !client.filters.contains(&filter)
            {
                client.filters.push(filter);
            }
        }
        BrokerFrame::Unsubscribe { filter } => {
            if let Some(client) = clients.lock().get_mut(&id) {
                client.filters.retain(|existing| existing != &filter);
            }
        }
        BrokerFrame::Publish { topic, body } => route(clients, topic, body),
        BrokerFrame::Ping => {
            let _ = outbox.send(BrokerFrame::Pong).await;
        }
        BrokerFrame::Pong | BrokerFrame::Deliver { .. } => {}
    }
}

fn route(clients: &ClientTable, topic: String, body: String) {
    let targets: Vec<(SocketAddr, mpsc::Sender<BrokerFrame>)> = clients
        .lock()
        .values()
        .filter(|client| {
            client
                .filters
                .iter()
                .any(|filter| topics::matches(filter, &topic))
        })
        .map(|client| (client.peer, client.outbox.clone()))
        .collect();
    for (peer, outbox) in targets {
        let frame = BrokerFrame::Deliver {
            topic: topic.clone(),
            body: body.clone(),
        };
        if outbox.try_send(frame).is_err() {
            warn!(%peer, %topic, "broker client outbox full; frame dropped");
        }
    }
}

/// Client side of the broker protocol.
pub struct BrokerTransport {
    name: String,
    address: String,
    connect_timeout: Duration,
    probe_timeout: Duration,
    subscriptions: Arc<SubscriptionTable>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by the reader on every `pong`.
    pongs: Arc<watch::Sender<u64>>,
}

impl BrokerTransport {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            subscriptions: Arc::new(SubscriptionTable::default()),
            writer: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            pongs: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long a health probe waits for the broker's `pong`.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    async fn write_frame(&self, frame: &BrokerFrame) -> HspResult<()> {
        let line = frame.to_line()?;
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(HspError::Transport(format!("{} is not connected", self.name)));
        };
        if let Err(error) = stream.write_all(&line).await {
            *writer = None;
            self.connected.store(false, Ordering::SeqCst);
            return Err(HspError::transport(error));
        }
        Ok(())
    }

    fn spawn_reader(&self, read: tokio::net::tcp::OwnedReadHalf) -> JoinHandle<()> {
        let subscriptions = Arc::clone(&self.subscriptions);
        let connected = Arc::clone(&self.connected);
        let pongs = Arc::clone(&self.pongs);
        let via = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match BrokerFrame::parse(&line) {
                        Ok(BrokerFrame::Deliver { topic, body }) => {
                            subscriptions
                                .dispatch(InboundFrame {
                                    topic,
                                    bytes: body.into_bytes(),
                                    via: via.clone(),
                                })
                                .await;
                        }
                        Ok(BrokerFrame::Pong) => {
                            debug!(transport = %via, "broker pong");
                            pongs.send_modify(|count| *count = count.wrapping_add(1));
                        }
                        Ok(other) => debug!(transport = %via, ?other, "unexpected broker frame"),
                        Err(error) => warn!(transport = %via, %error, "malformed broker frame"),
                    },
                    Ok(None) => {
                        warn!(transport = %via, "broker closed the connection");
                        break;
                    }
                    Err(error) => {
                        warn!(transport = %via, %error, "broker connection failed");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        })
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    #[instrument(skip(self), fields(transport = %self.name, address = %self.address))]
    async fn connect(&self) -> HspResult<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                HspError::Transport(format!(
                    "connect to {} timed out after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(|error| HspError::Transport(format!("connect to {}: {error}", self.address)))?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let reader = self.spawn_reader(read);
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }
        *self.writer.lock().await = Some(write);
        self.connected.store(true, Ordering::SeqCst);

        for filter in self.subscriptions.filters() {
            self.write_frame(&BrokerFrame::Subscribe { filter }).await?;
        }
        info!("connected to hsp broker");
        Ok(())
    }

    async fn disconnect(&self) -> HspResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()> {
        if !self.is_healthy() {
            return Err(HspError::Transport(format!("{} is not connected", self.name)));
        }
        let body = String::from_utf8(bytes.to_vec())
            .map_err(|error| HspError::Transport(format!("frame is not UTF-8: {error}")))?;
        self.write_frame(&BrokerFrame::Publish {
            topic: topic.to_owned(),
            body,
        })
        .await
    }

    async fn subscribe(
        &self,
        filter: &str,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> HspResult<()> {
        self.subscriptions.add(filter, inbound)?;
        if self.is_healthy() {
            // Re-sent on the next successful connect if this write fails.
            if let Err(error) = self
                .write_frame(&BrokerFrame::Subscribe {
                    filter: filter.to_owned(),
                })
                .await
            {
                debug!(%error, filter, "deferred broker subscription");
            }
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        if !self.is_healthy() {
            return self.connect().await.is_ok();
        }
        let mut pongs = self.pongs.subscribe();
        pongs.borrow_and_update();
        if self.write_frame(&BrokerFrame::Ping).await.is_err() {
            return false;
        }
        match tokio::time::timeout(self.probe_timeout, pongs.changed()).await {
            Ok(Ok(())) => true,
            _ => {
                warn!(transport = %self.name, timeout = ?self.probe_timeout, "broker did not answer ping");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
