//! Point-to-point HTTP fallback.
//!
//! Each agent may expose `POST /hsp/v1/messages` and `GET /healthz`; publishes
//! are POSTed to every configured peer endpoint and succeed when at least one
//! peer accepts the frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hsp_protocol::{HspError, HspResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::{InboundFrame, SubscriptionTable, Transport, TransportKind};

pub const MESSAGES_PATH: &str = "/hsp/v1/messages";
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Address to serve the inbound endpoint on; `None` makes the adapter
    /// send-only.
    pub listen: Option<SocketAddr>,
    /// Base URLs of peer agents, e.g. `http://10.0.0.2:8931`.
    pub peers: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpFrame {
    topic: String,
    body: String,
}

#[derive(Clone)]
struct ServerState {
    via: String,
    subscriptions: Arc<SubscriptionTable>,
}

pub struct HttpTransport {
    name: String,
    config: HttpTransportConfig,
    client: reqwest::Client,
    subscriptions: Arc<SubscriptionTable>,
    connected: AtomicBool,
    peers_ok: AtomicBool,
    bound: Mutex<Option<SocketAddr>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(name: impl Into<String>, config: HttpTransportConfig) -> HspResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| HspError::Config(format!("http client: {error}")))?;
        Ok(Self {
            name: name.into(),
            config,
            client,
            subscriptions: Arc::new(SubscriptionTable::default()),
            connected: AtomicBool::new(false),
            peers_ok: AtomicBool::new(true),
            bound: Mutex::new(None),
            server: Mutex::new(None),
        })
    }

    /// Address the inbound endpoint is actually bound to (after `connect`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    fn endpoint(peer: &str, path: &str) -> String {
        format!("{}{path}", peer.trim_end_matches('/'))
    }

    fn router(state: ServerState) -> Router {
        Router::new()
            .route(HEALTH_PATH, get(healthz))
            .route(MESSAGES_PATH, post(receive_message))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "hsp-http-transport"
    }))
}

async fn receive_message(
    State(state): State<ServerState>,
    Json(frame): Json<HttpFrame>,
) -> StatusCode {
    if !hsp_protocol::topics::is_valid_topic(&frame.topic) {
        return StatusCode::BAD_REQUEST;
    }
    state
        .subscriptions
        .dispatch(InboundFrame {
            topic: frame.topic,
            bytes: frame.body.into_bytes(),
            via: state.via.clone(),
        })
        .await;
    StatusCode::ACCEPTED
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::HttpFallback
    }

    #[instrument(skip(self), fields(transport = %self.name))]
    async fn connect(&self) -> HspResult<()> {
        let already_serving = self.server.lock().is_some();
        if let Some(listen) = self.config.listen
            && !already_serving
        {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            let local = listener.local_addr()?;
            let app = Self::router(ServerState {
                via: self.name.clone(),
                subscriptions: Arc::clone(&self.subscriptions),
            });
            let via = self.name.clone();
            let handle = tokio::spawn(async move {
                if let Err(error) = axum::serve(listener, app).await {
                    warn!(transport = %via, %error, "http transport server stopped");
                }
            });
            *self.bound.lock() = Some(local);
            *self.server.lock() = Some(handle);
            info!(listen = %local, "http transport listening");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> HspResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(server) = self.server.lock().take() {
            server.abort();
        }
        *self.bound.lock() = None;
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(transport = %self.name, topic = %topic, peers = self.config.peers.len()))]
    async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HspError::Transport(format!("{} is not connected", self.name)));
        }
        if self.config.peers.is_empty() {
            return Err(HspError::Transport(format!(
                "{} has no peer endpoints",
                self.name
            )));
        }
        let body = String::from_utf8(bytes.to_vec())
            .map_err(|error| HspError::Transport(format!("frame is not UTF-8: {error}")))?;
        let frame = HttpFrame {
            topic: topic.to_owned(),
            body,
        };

        let mut accepted = 0usize;
        let mut last_error = None;
        for peer in &self.config.peers {
            let url = Self::endpoint(peer, MESSAGES_PATH);
            match self.client.post(&url).json(&frame).send().await {
                Ok(response) if response.status().is_success() => accepted += 1,
                Ok(response) => {
                    last_error = Some(format!("{url} answered {}", response.status()));
                }
                Err(error) => last_error = Some(format!("{url}: {error}")),
            }
        }

        self.peers_ok.store(accepted > 0, Ordering::SeqCst);
        if accepted == 0 {
            return Err(HspError::Transport(
                last_error.unwrap_or_else(|| "no peer accepted the frame".to_owned()),
            ));
        }
        debug!(accepted, "frame posted to peers");
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
        self.connected.load(Ordering::SeqCst) && self.peers_ok.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if self.config.peers.is_empty() {
            return true;
        }
        let mut reachable = false;
        for peer in &self.config.peers {
            let url = Self::endpoint(peer, HEALTH_PATH);
            if let Ok(response) = self.client.get(&url).send().await
                && response.status().is_success()
            {
                reachable = true;
                break;
            }
        }
        self.peers_ok.store(reachable, Ordering::SeqCst);
        reachable
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(server) = self.server.get_mut().take() {
            server.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn posts_frames_to_peer_endpoint() -> Result<()> {
        let receiver = HttpTransport::new(
            "http-b",
            HttpTransportConfig {
                listen: Some(loopback()),
                ..HttpTransportConfig::default()
            },
        )?;
        receiver.connect().await?;
        let addr = receiver
            .local_addr()
            .ok_or_else(|| anyhow::anyhow!("receiver not bound"))?;
        let (tx, mut rx) = mpsc::channel(8);
        receiver.subscribe("hsp/results/+", tx).await?;

        let sender = HttpTransport::new(
            "http-a",
            HttpTransportConfig {
                peers: vec![format!("http://{addr}/")],
                ..HttpTransportConfig::default()
            },
        )?;
        sender.connect().await?;
        assert!(sender.probe().await);
        sender.publish("hsp/results/A", br#"{"ok":true}"#).await?;

        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel closed"))?;
        assert_eq!(frame.topic, "hsp/results/A");
        assert_eq!(frame.via, "http-b");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_peers_fail_publish_and_mark_unhealthy() -> Result<()> {
        let sender = HttpTransport::new(
            "http-a",
            HttpTransportConfig {
                peers: vec!["http://127.0.0.1:9".to_owned()],
                request_timeout: Duration::from_millis(300),
                ..HttpTransportConfig::default()
            },
        )?;
        sender.connect().await?;
        assert!(sender.publish("hsp/acks/B", b"{}").await.is_err());
        assert!(!sender.is_healthy());
        Ok(())
    }
}
