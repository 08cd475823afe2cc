use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use hsp_protocol::{HspError, HspResult};
use hsp_transport::{InboundFrame, Transport, TransportKind};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{AdapterHealth, FallbackPolicy, HealthState, Transition};

const NO_ACTIVE: usize = usize::MAX;

struct AdapterSlot {
    transport: Arc<dyn Transport>,
    priority: u32,
    health: AdapterHealth,
}

/// Point-in-time view of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub kind: TransportKind,
    pub priority: u32,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub active: bool,
}

pub struct FallbackManager {
    slots: Vec<AdapterSlot>,
    policy: FallbackPolicy,
    active: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackManager {
    /// Adapters with equal priority keep their given order.
    pub fn new(adapters: Vec<(Arc<dyn Transport>, u32)>, policy: FallbackPolicy) -> Self {
        let mut slots: Vec<AdapterSlot> = adapters
            .into_iter()
            .map(|(transport, priority)| AdapterSlot {
                transport,
                priority,
                health: AdapterHealth::default(),
            })
            .collect();
        slots.sort_by_key(|slot| slot.priority);
        Self {
            slots,
            policy,
            active: AtomicUsize::new(NO_ACTIVE),
            monitor: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn status(&self) -> Vec<AdapterStatus> {
        let active = self.active.load(Ordering::Acquire);
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| AdapterStatus {
                name: slot.transport.name().to_owned(),
                kind: slot.transport.kind(),
                priority: slot.priority,
                state: slot.health.state(),
                consecutive_failures: slot.health.consecutive_failures(),
                consecutive_successes: slot.health.consecutive_successes(),
                active: index == active,
            })
            .collect()
    }

    /// Name of the adapter that carried the last successful publish.
    pub fn active(&self) -> Option<String> {
        let index = self.active.load(Ordering::Acquire);
        self.slots
            .get(index)
            .map(|slot| slot.transport.name().to_owned())
    }

    /// Connect every adapter. Fails only if none could connect.
    #[instrument(skip(self), fields(adapters = self.slots.len()))]
    pub async fn connect(&self) -> HspResult<()> {
        if self.slots.is_empty() {
            return Err(HspError::Config("no transports configured".to_owned()));
        }
        let outcomes = join_all(self.slots.iter().map(|slot| slot.transport.connect())).await;
        let mut connected = 0usize;
        for (slot, outcome) in self.slots.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    connected += 1;
                    self.log_transition(slot, slot.health.record_success(self.policy.promote_after));
                }
                Err(error) => {
                    warn!(transport = slot.transport.name(), %error, "transport failed to connect");
                    self.log_transition(slot, slot.health.force(HealthState::Unhealthy));
                }
            }
        }
        if connected == 0 {
            return Err(HspError::TransportUnavailable(
                "no transport could connect".to_owned(),
            ));
        }
        info!(connected, "transports connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        for slot in &self.slots {
            if let Err(error) = slot.transport.disconnect().await {
                debug!(transport = slot.transport.name(), %error, "disconnect failed");
            }
        }
    }

    /// Routable slots: healthy by priority, then degraded, then unknown.
    fn candidates(&self) -> Vec<usize> {
        let mut ordered = Vec::with_capacity(self.slots.len());
        for wanted in [
            HealthState::Healthy,
            HealthState::Degraded,
            HealthState::Unknown,
        ] {
            ordered.extend(
                self.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.health.state() == wanted)
                    .map(|(index, _)| index),
            );
        }
        ordered
    }

    #[instrument(skip(self, bytes), fields(topic = %topic, size = bytes.len()))]
    pub async fn publish(&self, topic: &str, bytes: &[u8]) -> HspResult<()> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(HspError::TransportUnavailable(
                "every transport is unhealthy".to_owned(),
            ));
        }

        let send_timeout = self.policy.send_timeout();
        let mut first_timeout: Option<String> = None;
        let mut attempts_after_timeout = 0usize;
        let mut last_error: Option<HspError> = None;

        for index in candidates {
            if first_timeout.is_some() && attempts_after_timeout >= 1 {
                break;
            }
            if first_timeout.is_some() {
                attempts_after_timeout += 1;
            }

            let slot = &self.slots[index];
            let name = slot.transport.name();
            if slot.health.state() == HealthState::Degraded {
                warn!(transport = name, "routing through degraded transport");
            }

            match tokio::time::timeout(send_timeout, slot.transport.publish(topic, bytes)).await {
                Ok(Ok(())) => {
                    self.log_transition(slot, slot.health.record_success(self.policy.promote_after));
                    self.mark_active(index);
                    return Ok(());
                }
                Ok(Err(error)) => {
                    debug!(transport = name, %error, "publish failed; trying next transport");
                    self.log_transition(slot, slot.health.record_failure(self.policy.demote_after));
                    last_error = Some(error);
                }
                Err(_) => {
                    warn!(transport = name, timeout_ms = self.policy.send_timeout_ms, "publish timed out");
                    self.log_transition(slot, slot.health.record_timeout());
                    if first_timeout.is_none() {
                        first_timeout = Some(name.to_owned());
                    }
                }
            }
        }

        if let Some(transport) = first_timeout {
            return Err(HspError::PublishTimeout {
                transport,
                timeout_ms: self.policy.send_timeout_ms,
            });
        }
        Err(HspError::TransportUnavailable(
            last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no transport accepted the frame".to_owned()),
        ))
    }

    /// Register `filter` on every adapter so traffic arriving over any of
    /// them reaches `inbound`.
    pub async fn subscribe(
        &self,
        filter: &str,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> HspResult<()> {
        let mut registered = 0usize;
        let mut last_error = None;
        for slot in &self.slots {
            match slot.transport.subscribe(filter, inbound.clone()).await {
                Ok(()) => registered += 1,
                Err(error) => {
                    warn!(transport = slot.transport.name(), filter, %error, "subscribe failed");
                    last_error = Some(error);
                }
            }
        }
        match (registered, last_error) {
            (0, Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    /// Probe every adapter once and feed the outcomes into its health.
    pub async fn probe_all(&self) {
        let send_timeout = self.policy.send_timeout();
        let outcomes = join_all(self.slots.iter().map(|slot| async move {
            tokio::time::timeout(send_timeout, slot.transport.probe())
                .await
                .unwrap_or(false)
        }))
        .await;
        for (slot, healthy) in self.slots.iter().zip(outcomes) {
            let transition = if healthy {
                slot.health.record_success(self.policy.promote_after)
            } else {
                slot.health.record_failure(self.policy.demote_after)
            };
            self.log_transition(slot, transition);
        }
    }

    /// Run [`Self::probe_all`] every `probe_interval` until closed.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.policy.probe_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.probe_all().await;
            }
        });
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn close(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.disconnect().await;
    }

    fn mark_active(&self, index: usize) {
        let previous = self.active.swap(index, Ordering::AcqRel);
        if previous == index {
            return;
        }
        let current = &self.slots[index];
        match self.slots.get(previous) {
            Some(old) if old.priority < current.priority => warn!(
                from = old.transport.name(),
                to = current.transport.name(),
                "failed over to lower-priority transport"
            ),
            Some(old) => info!(
                from = old.transport.name(),
                to = current.transport.name(),
                "failed back to higher-priority transport"
            ),
            None => info!(transport = current.transport.name(), "transport active"),
        }
    }

    fn log_transition(&self, slot: &AdapterSlot, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            info!(
                transport = slot.transport.name(),
                %from,
                %to,
                "transport health changed"
            );
        }
    }
}

impl Drop for FallbackManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}
