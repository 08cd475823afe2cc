//! File-drop fallback: a shared spool directory of one JSON frame per file.
//!
//! Writers stage each frame under a `.tmp` name and rename it into place, so
//! readers never observe a partial file. Every attached transport polls the
//! directory; frames are left for other readers and removed only by the
//! retention sweep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsp_protocol::{HspError, HspResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{InboundFrame, SubscriptionTable, Transport, TransportKind};

const FRAME_EXTENSION: &str = "json";
const STAGING_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
pub struct FileTransportConfig {
    pub root: PathBuf,
    pub poll_interval: Duration,
    pub retention: Duration,
}

impl FileTransportConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_millis(200),
            retention: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SpoolFrame {
    topic: String,
    written_at: DateTime<Utc>,
    body: String,
}

#[derive(Debug, Default)]
struct SpoolState {
    processed: HashSet<String>,
}

pub struct FileTransport {
    name: String,
    config: FileTransportConfig,
    subscriptions: Arc<SubscriptionTable>,
    state: Arc<Mutex<SpoolState>>,
    connected: Arc<AtomicBool>,
    root_ok: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl FileTransport {
    pub fn new(name: impl Into<String>, config: FileTransportConfig) -> Self {
        Self {
            name: name.into(),
            config,
            subscriptions: Arc::new(SubscriptionTable::default()),
            state: Arc::new(Mutex::new(SpoolState::default())),
            connected: Arc::new(AtomicBool::new(false)),
            root_ok: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn frame_name() -> String {
        let millis = Utc::now().timestamp_millis().max(0);
        format!(
            "{millis:015}-{}.{FRAME_EXTENSION}",
            Uuid::new_v4().simple()
        )
    }

    async fn list_frames(root: &Path) -> HspResult<Vec<PathBuf>> {
        let mut entries = fs::read_dir(root).await?;
        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == FRAME_EXTENSION) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }

    fn file_key(path: &Path) -> Option<String> {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
    }

    async fn poll_once(
        root: &Path,
        via: &str,
        retention: Duration,
        state: &Mutex<SpoolState>,
        subscriptions: &SubscriptionTable,
    ) -> HspResult<()> {
        for path in Self::list_frames(root).await? {
            let Some(key) = Self::file_key(&path) else {
                continue;
            };
            let seen = state.lock().processed.contains(&key);
            if seen {
                Self::collect_if_expired(&path, &key, retention, state).await;
                continue;
            }
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            state.lock().processed.insert(key);
            let frame: SpoolFrame = match serde_json::from_slice(&raw) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable spool frame");
                    continue;
                }
            };
            subscriptions
                .dispatch(InboundFrame {
                    topic: frame.topic,
                    bytes: frame.body.into_bytes(),
                    via: via.to_owned(),
                })
                .await;
        }
        Ok(())
    }

    async fn collect_if_expired(
        path: &Path,
        key: &str,
        retention: Duration,
        state: &Mutex<SpoolState>,
    ) {
        let Ok(metadata) = fs::metadata(path).await else {
            let _ = state.lock().processed.remove(key);
            return;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) {
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "spool frame expired"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => warn!(path = %path.display(), %error, "failed to expire spool frame"),
            }
            state.lock().processed.remove(key);
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::FileFallback
    }

    #[instrument(skip(self), fields(transport = %self.name, root = %self.config.root.display()))]
    async fn connect(&self) -> HspResult<()> {
        fs::create_dir_all(&self.config.root).await?;

        // Frames already in the spool predate this reader.
        let existing = Self::list_frames(&self.config.root).await?;
        {
            let mut state = self.state.lock();
            for path in &existing {
                if let Some(key) = Self::file_key(path) {
                    state.processed.insert(key);
                }
            }
        }
        self.root_ok.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let mut poller = self.poller.lock();
        if poller.is_none() {
            let root = self.config.root.clone();
            let interval = self.config.poll_interval;
            let retention = self.config.retention;
            let via = self.name.clone();
            let state = Arc::clone(&self.state);
            let subscriptions = Arc::clone(&self.subscriptions);
            let root_ok = Arc::clone(&self.root_ok);
            *poller = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    match Self::poll_once(&root, &via, retention, &state, &subscriptions).await {
                        Ok(()) => root_ok.store(true, Ordering::SeqCst),
                        Err(error) => {
                            if root_ok.swap(false, Ordering::SeqCst) {
                                warn!(transport = %via, %error, "spool directory unreadable");
                            }
                        }
                    }
                }
            }));
        }
        debug!(existing = existing.len(), "file transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> HspResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(transport = %self.name, topic = %topic, size = bytes.len()))]
    async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HspError::Transport(format!("{} is not connected", self.name)));
        }
        let body = String::from_utf8(bytes.to_vec())
            .map_err(|error| HspError::Transport(format!("frame is not UTF-8: {error}")))?;
        let frame = SpoolFrame {
            topic: topic.to_owned(),
            written_at: Utc::now(),
            body,
        };
        let encoded = serde_json::to_vec(&frame)
            .map_err(|error| HspError::Transport(format!("failed encoding spool frame: {error}")))?;

        let final_path = self.config.root.join(Self::frame_name());
        let staging_path = final_path.with_extension(STAGING_EXTENSION);
        let written = async {
            fs::write(&staging_path, &encoded).await?;
            fs::rename(&staging_path, &final_path).await
        }
        .await;
        if let Err(error) = written {
            self.root_ok.store(false, Ordering::SeqCst);
            let _ = fs::remove_file(&staging_path).await;
            return Err(HspError::Transport(format!(
                "failed writing spool frame {}: {error}",
                final_path.display()
            )));
        }
        debug!("spool frame written");
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
        self.connected.load(Ordering::SeqCst) && self.root_ok.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let reachable = fs::metadata(&self.config.root)
            .await
            .is_ok_and(|metadata| metadata.is_dir());
        self.root_ok.store(reachable, Ordering::SeqCst);
        reachable
    }
}

impl Drop for FileTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use anyhow::Result;
    use tokio::time::timeout;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn fast_config(root: &Path) -> FileTransportConfig {
        FileTransportConfig {
            root: root.to_path_buf(),
            poll_interval: Duration::from_millis(20),
            retention: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn frames_written_by_one_transport_reach_another() -> Result<()> {
        let root = unique_test_root("hsp-file-transport");
        let writer = FileTransport::new("file-a", fast_config(&root));
        let reader = FileTransport::new("file-b", fast_config(&root));
        writer.connect().await?;
        reader.connect().await?;

        let (tx, mut rx) = mpsc::channel(8);
        reader.subscribe("hsp/requests/+", tx).await?;
        writer.publish("hsp/requests/B", br#"{"hello":1}"#).await?;

        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel closed"))?;
        assert_eq!(frame.topic, "hsp/requests/B");
        assert_eq!(frame.bytes, br#"{"hello":1}"#);

        // Not delivered a second time on later polls.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        let staged = FileTransport::list_frames(&root).await?;
        assert_eq!(staged.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn frames_present_before_connect_are_not_replayed() -> Result<()> {
        let root = unique_test_root("hsp-file-transport-replay");
        let writer = FileTransport::new("file-a", fast_config(&root));
        writer.connect().await?;
        writer.publish("hsp/acks/A", b"{}").await?;

        let late = FileTransport::new("file-late", fast_config(&root));
        late.connect().await?;
        let (tx, mut rx) = mpsc::channel(8);
        late.subscribe("hsp/#", tx).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn expired_frames_are_collected() -> Result<()> {
        let root = unique_test_root("hsp-file-transport-gc");
        let config = FileTransportConfig {
            retention: Duration::ZERO,
            ..fast_config(&root)
        };
        let transport = FileTransport::new("file-gc", config);
        transport.connect().await?;
        transport.publish("hsp/acks/A", b"{}").await?;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let remaining = FileTransport::list_frames(&root).await?;
        assert!(remaining.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn publish_requires_connect() {
        let root = unique_test_root("hsp-file-transport-closed");
        let transport = FileTransport::new("file", fast_config(&root));
        assert!(transport.publish("hsp/acks/A", b"{}").await.is_err());
        assert!(!transport.probe().await);
    }
}
