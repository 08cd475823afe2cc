use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use hsp_conflict::{ConflictConfig, ConflictResolver, Resolution};
use hsp_fallback::{AdapterStatus, FallbackManager, FallbackPolicy};
use hsp_protocol::{
    Acknowledgement, AgentId, Belief, CapabilityAdvertisement, CapabilityId, Clock, Codec,
    Envelope, EnvelopeDraft, EnvironmentalState, ErrorCode, Fact, FactSink, FillPolicy, HspError,
    HspResult, IngestedFact, IngestedKnowledge, MessageId, MetricsSink, NegativeAcknowledgement,
    Opinion, Pattern, PayloadKind, Qos, RequestId, SalvagedHeader, SystemClock, TaskRequest,
    TaskResult, TaskStatus, TracingMetrics, topics,
};
use hsp_registry::{CapabilityRegistry, DiscoveryQuery, RegistryConfig};
use hsp_transport::{InboundFrame, Transport, TransportFactory};
use hsp_trust::{TrustConfig, TrustManager};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{AgentConfig, ConnectorSettings};
use crate::handler::{MessageHandler, Selector, SubscriptionId};
use crate::pending::{PendingTable, PendingTask};
use crate::tracking::{AckTracker, DeliveryState, RecentIds};

/// Topics every connector listens on.
fn core_filters(agent_id: &AgentId) -> Vec<String> {
    vec![
        topics::requests(agent_id),
        topics::results(agent_id),
        topics::acks(agent_id),
        topics::ALL_FACTS.to_owned(),
        topics::ALL_BELIEFS.to_owned(),
        topics::ALL_OPINIONS.to_owned(),
        topics::ALL_CAPABILITY_ADVERTISEMENTS.to_owned(),
        topics::ALL_ENVIRONMENT_STATE.to_owned(),
    ]
}

pub struct ConnectorBuilder {
    agent_id: AgentId,
    settings: ConnectorSettings,
    transports: Vec<(Arc<dyn Transport>, u32)>,
    fallback: FallbackPolicy,
    trust: Option<Arc<TrustManager>>,
    trust_config: TrustConfig,
    registry: Option<Arc<CapabilityRegistry>>,
    registry_config: RegistryConfig,
    conflict: ConflictConfig,
    codec: Option<Codec>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    fact_sink: Option<Arc<dyn FactSink>>,
    capabilities: Vec<CapabilityAdvertisement>,
}

impl ConnectorBuilder {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            settings: ConnectorSettings::default(),
            transports: Vec::new(),
            fallback: FallbackPolicy::default(),
            trust: None,
            trust_config: TrustConfig::default(),
            registry: None,
            registry_config: RegistryConfig::default(),
            conflict: ConflictConfig::default(),
            codec: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(TracingMetrics),
            fact_sink: None,
            capabilities: Vec::new(),
        }
    }

    /// Builder pre-filled from a validated config, with adapters built by
    /// `factory` in the order they are listed.
    pub fn from_config(config: &AgentConfig, factory: &TransportFactory) -> HspResult<Self> {
        config.validate()?;
        let mut builder = Self::new(config.agent_id.clone())
            .settings(config.connector.clone())
            .fallback_policy(config.fallback.clone())
            .trust_config(config.trust.clone())
            .registry_config(config.registry.clone())
            .conflict(config.conflict.clone());
        for (priority, spec) in config.transports.iter().enumerate() {
            let priority = u32::try_from(priority)
                .map_err(|_| HspError::Config("too many transports".to_owned()))?;
            builder = builder.transport(factory.build(spec)?, priority);
        }
        for ad in config.advertisements() {
            builder = builder.capability(ad);
        }
        Ok(builder)
    }

    pub fn settings(mut self, settings: ConnectorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Lower `priority` is preferred.
    pub fn transport(mut self, transport: Arc<dyn Transport>, priority: u32) -> Self {
        self.transports.push((transport, priority));
        self
    }

    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Share an existing trust manager instead of creating one.
    pub fn trust(mut self, trust: Arc<TrustManager>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn trust_config(mut self, config: TrustConfig) -> Self {
        self.trust_config = config;
        self
    }

    /// Share an existing registry instead of creating one.
    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry_config = config;
        self
    }

    pub fn conflict(mut self, config: ConflictConfig) -> Self {
        self.conflict = config;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn fact_sink(mut self, sink: Arc<dyn FactSink>) -> Self {
        self.fact_sink = Some(sink);
        self
    }

    /// Advertised on connect and re-advertised periodically.
    pub fn capability(mut self, ad: CapabilityAdvertisement) -> Self {
        self.capabilities.push(ad);
        self
    }

    pub fn build(self) -> HspResult<Connector> {
        if self.agent_id.is_blank() {
            return Err(HspError::Config("agent_id must not be empty".to_owned()));
        }
        if self.transports.is_empty() {
            return Err(HspError::Config("no transports configured".to_owned()));
        }
        if let Some(foreign) = self
            .capabilities
            .iter()
            .find(|ad| ad.agent_id != self.agent_id)
        {
            return Err(HspError::Config(format!(
                "capability {} belongs to {}, not {}",
                foreign.capability_id, foreign.agent_id, self.agent_id
            )));
        }

        let trust = self
            .trust
            .unwrap_or_else(|| Arc::new(TrustManager::new(self.trust_config)));
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(CapabilityRegistry::new(
                self.registry_config,
                Arc::clone(&trust),
                Arc::clone(&self.clock),
            )?),
        };
        let conflict = Arc::new(ConflictResolver::new(
            self.agent_id.clone(),
            self.conflict,
            Arc::clone(&trust),
            Arc::clone(&self.clock),
        ));
        let capabilities = self
            .capabilities
            .into_iter()
            .map(|ad| (ad.capability_id.clone(), ad))
            .collect();

        Ok(Connector {
            inner: Arc::new(Inner {
                codec: self.codec.unwrap_or_default(),
                fallback: Arc::new(FallbackManager::new(self.transports, self.fallback)),
                trust,
                registry,
                conflict,
                clock: self.clock,
                metrics: self.metrics,
                fact_sink: self.fact_sink,
                pending: PendingTable::default(),
                acks: Mutex::new(AckTracker::new(self.settings.dedupe_capacity)),
                seen: Mutex::new(RecentIds::new(self.settings.dedupe_capacity)),
                inbound_requests: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                topic_filters: Mutex::new(Vec::new()),
                capabilities: Mutex::new(capabilities),
                inbound_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                agent_id: self.agent_id,
                settings: self.settings,
            }),
        })
    }
}

/// An inbound request we may still answer.
#[derive(Debug, Clone)]
struct InboundRequest {
    requester: AgentId,
    message_id: MessageId,
    /// The request's deadline, or receipt time plus the default timeout.
    expires_at: DateTime<Utc>,
}

struct Delivery {
    envelope: Arc<Envelope>,
    done: Option<oneshot::Sender<HspResult<()>>>,
}

struct Subscriber {
    id: SubscriptionId,
    selector: Selector,
    sender: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

/// Addressing of one outbound envelope.
struct Outbound {
    kind: PayloadKind,
    recipient: String,
    topic: String,
    pattern: Pattern,
    correlation_id: Option<MessageId>,
    qos: Option<Qos>,
    message_id: Option<MessageId>,
}

impl Outbound {
    fn broadcast(kind: PayloadKind, topic: String) -> Self {
        Self {
            kind,
            recipient: topic.clone(),
            topic,
            pattern: Pattern::Publish,
            correlation_id: None,
            qos: None,
            message_id: None,
        }
    }

    /// `target` is either a topic or an agent id; agents get `kind`'s topic.
    fn addressed(kind: PayloadKind, target: &str) -> Self {
        Self {
            kind,
            recipient: target.to_owned(),
            topic: topics::route(target, |agent| topics::default_topic(kind, agent)),
            pattern: Pattern::Publish,
            correlation_id: None,
            qos: None,
            message_id: None,
        }
    }

    fn reply(kind: PayloadKind, to: &AgentId, topic: String, correlation_id: MessageId) -> Self {
        Self {
            kind,
            recipient: to.to_string(),
            topic,
            pattern: Pattern::Response,
            correlation_id: Some(correlation_id),
            qos: None,
            message_id: None,
        }
    }
}

struct Inner {
    agent_id: AgentId,
    settings: ConnectorSettings,
    codec: Codec,
    fallback: Arc<FallbackManager>,
    trust: Arc<TrustManager>,
    registry: Arc<CapabilityRegistry>,
    conflict: Arc<ConflictResolver>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    fact_sink: Option<Arc<dyn FactSink>>,
    pending: PendingTable,
    acks: Mutex<AckTracker>,
    seen: Mutex<RecentIds>,
    inbound_requests: Mutex<HashMap<RequestId, InboundRequest>>,
    subscribers: Mutex<Vec<Subscriber>>,
    topic_filters: Mutex<Vec<String>>,
    capabilities: Mutex<IndexMap<CapabilityId, CapabilityAdvertisement>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_subscription: AtomicU64,
    connected: AtomicBool,
}

impl Inner {
    async fn send<T: Serialize>(&self, outbound: Outbound, payload: &T) -> HspResult<Envelope> {
        let mut draft = EnvelopeDraft::for_payload(
            self.agent_id.clone(),
            outbound.recipient,
            outbound.kind,
            outbound.pattern,
            payload,
        )?
        .with_qos(outbound.qos);
        if let Some(message_id) = outbound.message_id {
            draft = draft.with_message_id(message_id);
        }
        if let Some(correlation_id) = outbound.correlation_id {
            draft = draft.with_correlation_id(correlation_id);
        }
        let envelope = self
            .codec
            .seal(draft, FillPolicy::FillMissing, self.clock.as_ref())?;
        let bytes = self.codec.encode(&envelope)?;

        if envelope.requires_ack() {
            self.acks.lock().track(envelope.message_id.clone());
        }
        let started = tokio::time::Instant::now();
        if let Err(error) = self.fallback.publish(&outbound.topic, &bytes).await {
            self.acks.lock().forget(&envelope.message_id);
            self.metrics
                .increment("hsp.outbound.failed", outbound.kind.name());
            return Err(error);
        }
        self.metrics.increment("hsp.outbound", outbound.kind.name());
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics
            .observe_ms("hsp.publish.latency", outbound.kind.name(), elapsed_ms);
        debug!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            topic = %outbound.topic,
            "envelope published"
        );
        Ok(envelope)
    }

    async fn send_ack(&self, to: &AgentId, target: &MessageId) -> HspResult<()> {
        let ack = Acknowledgement {
            target_message_id: target.clone(),
            acknowledged_at: self.clock.now(),
        };
        let outbound = Outbound::reply(
            PayloadKind::Acknowledgement,
            to,
            topics::acks(to),
            target.clone(),
        );
        self.send(outbound, &ack).await.map(|_| ())
    }

    async fn send_nack(&self, to: &AgentId, nack: NegativeAcknowledgement) -> HspResult<()> {
        let outbound = Outbound::reply(
            PayloadKind::NegativeAcknowledgement,
            to,
            topics::acks(to),
            nack.target_message_id.clone(),
        );
        self.send(outbound, &nack).await.map(|_| ())
    }

    async fn advertise(&self, ad: &CapabilityAdvertisement) -> HspResult<MessageId> {
        self.registry.advertise(ad.clone());
        let outbound = Outbound::broadcast(
            PayloadKind::CapabilityAdvertisement,
            topics::capability_advertisements(&self.agent_id),
        );
        Ok(self.send(outbound, ad).await?.message_id)
    }

    async fn readvertise(&self) {
        let own: Vec<CapabilityAdvertisement> =
            self.capabilities.lock().values().cloned().collect();
        for ad in own {
            if let Err(error) = self.advertise(&ad).await {
                warn!(capability = %ad.capability_id, %error, "re-advertisement failed");
            }
        }
    }

    /// When an inbound request without a deadline stops being answerable.
    fn default_expiry(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(self.settings.request_timeout())
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Forget inbound requests past their expiry; returns how many went.
    fn evict_stale_requests(&self) -> usize {
        let now = self.clock.now();
        let mut inbound = self.inbound_requests.lock();
        let before = inbound.len();
        inbound.retain(|_, request| request.expires_at > now);
        let evicted = before - inbound.len();
        if evicted > 0 {
            debug!(evicted, open = inbound.len(), "stale inbound requests evicted");
        }
        evicted
    }

    fn expire_request(&self, request_id: &RequestId) {
        if let Some(settled) = self.pending.expire(request_id) {
            warn!(request_id = %request_id, "task request timed out");
            self.metrics.increment("hsp.request.timeout", request_id.as_str());
            if let Some(target) = settled.target {
                self.trust.record_outcome(&target, false);
            }
        }
    }

    /// Why an otherwise valid envelope is not processed, if it is not.
    fn drop_reason(&self, envelope: &Envelope) -> Option<&'static str> {
        if envelope.sender_id == self.agent_id && !self.settings.deliver_own {
            return Some("own");
        }
        if !topics::is_topic(&envelope.recipient) && envelope.recipient != self.agent_id.as_str() {
            return Some("misaddressed");
        }
        if envelope.is_expired(self.clock.now()) {
            return Some("expired");
        }
        if !self.seen.lock().insert(&envelope.message_id) {
            return Some("duplicate");
        }
        None
    }

    async fn dispatch(self: &Arc<Self>, frame: InboundFrame) {
        let envelope = match self.codec.decode(&frame.bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.reject_undecodable(&frame, error).await;
                return;
            }
        };
        if let Some(reason) = self.drop_reason(&envelope) {
            debug!(
                message_id = %envelope.message_id,
                sender = %envelope.sender_id,
                reason,
                "inbound envelope dropped"
            );
            self.metrics.increment("hsp.inbound.dropped", reason);
            return;
        }
        self.metrics
            .increment("hsp.inbound", envelope.message_type.name());

        let envelope = Arc::new(envelope);
        self.apply_side_effects(&envelope).await;
        let completions = self.deliver(&envelope, &frame.topic).await;

        let is_ack = envelope.message_type.is(PayloadKind::Acknowledgement)
            || envelope.message_type.is(PayloadKind::NegativeAcknowledgement);
        if envelope.requires_ack() && !is_ack {
            self.acknowledge_after(envelope, completions);
        }
    }

    async fn reject_undecodable(&self, frame: &InboundFrame, error: HspError) {
        warn!(
            via = %frame.via,
            topic = %frame.topic,
            code = error.code().as_str(),
            %error,
            "inbound frame rejected"
        );
        self.metrics
            .increment("hsp.inbound.rejected", error.code().as_str());

        let Some(header) = SalvagedHeader::from_bytes(&frame.bytes) else {
            return;
        };
        let unsupported = error.code() == ErrorCode::UnsupportedVersion;
        if header.sender_id == self.agent_id || !(header.requires_ack || unsupported) {
            return;
        }
        let nack = NegativeAcknowledgement::from_error(header.message_id, &error, self.clock.now());
        if let Err(error) = self.send_nack(&header.sender_id, nack).await {
            warn!(%error, "could not NACK rejected frame");
        }
    }

    async fn apply_side_effects(&self, envelope: &Envelope) {
        let Some(kind) = envelope.message_type.kind() else {
            return;
        };
        match kind {
            PayloadKind::Fact => match envelope.decode_payload::<Fact>() {
                Ok(fact) => self.ingest(envelope, IngestedKnowledge::Fact(fact)).await,
                Err(error) => warn!(%error, "fact payload unreadable"),
            },
            PayloadKind::Belief => match envelope.decode_payload::<Belief>() {
                Ok(belief) => self.ingest(envelope, IngestedKnowledge::Belief(belief)).await,
                Err(error) => warn!(%error, "belief payload unreadable"),
            },
            PayloadKind::CapabilityAdvertisement => {
                match envelope.decode_payload::<CapabilityAdvertisement>() {
                    Ok(ad) if ad.agent_id == envelope.sender_id => {
                        self.registry.advertise(ad);
                    }
                    Ok(ad) => warn!(
                        sender = %envelope.sender_id,
                        advertised_for = %ad.agent_id,
                        "ignoring capability advertised on behalf of another agent"
                    ),
                    Err(error) => warn!(%error, "advertisement payload unreadable"),
                }
            }
            PayloadKind::TaskRequest => match envelope.decode_payload::<TaskRequest>() {
                Ok(request) => {
                    let expires_at = request
                        .deadline
                        .unwrap_or_else(|| self.default_expiry());
                    let mut inbound = self.inbound_requests.lock();
                    if inbound.contains_key(&request.request_id) {
                        debug!(request_id = %request.request_id, "request already outstanding");
                    } else {
                        inbound.insert(
                            request.request_id,
                            InboundRequest {
                                requester: envelope.sender_id.clone(),
                                message_id: envelope.message_id.clone(),
                                expires_at,
                            },
                        );
                    }
                }
                Err(error) => warn!(%error, "task request payload unreadable"),
            },
            PayloadKind::TaskResult => match envelope.decode_payload::<TaskResult>() {
                Ok(result) if result.status.is_terminal() => {
                    let request_id = result.request_id.clone();
                    let success = result.status == TaskStatus::Success;
                    match self
                        .pending
                        .complete(result, envelope.correlation_id.as_ref())
                    {
                        Some(_) => {
                            if success {
                                self.trust.record_outcome(&envelope.sender_id, true);
                            }
                            debug!(request_id = %request_id, "task request completed");
                        }
                        None => debug!(
                            request_id = %request_id,
                            "terminal result for a request that is not outstanding"
                        ),
                    }
                }
                Ok(result) => debug!(
                    request_id = %result.request_id,
                    status = ?result.status,
                    "progress result"
                ),
                Err(error) => warn!(%error, "task result payload unreadable"),
            },
            PayloadKind::Acknowledgement => match envelope.decode_payload::<Acknowledgement>() {
                Ok(ack) => {
                    let resolved = self
                        .acks
                        .lock()
                        .resolve(&ack.target_message_id, DeliveryState::Acknowledged);
                    if resolved {
                        self.trust.record_outcome(&envelope.sender_id, true);
                    }
                }
                Err(error) => warn!(%error, "ack payload unreadable"),
            },
            PayloadKind::NegativeAcknowledgement => {
                match envelope.decode_payload::<NegativeAcknowledgement>() {
                    Ok(nack) => {
                        warn!(
                            target = %nack.target_message_id,
                            sender = %envelope.sender_id,
                            code = %nack.error_code,
                            "message rejected by peer"
                        );
                        let resolved = self.acks.lock().resolve(
                            &nack.target_message_id,
                            DeliveryState::Rejected {
                                code: nack.error_code.clone(),
                                message: nack.error_message.clone(),
                            },
                        );
                        if resolved {
                            self.trust.record_outcome(&envelope.sender_id, false);
                        }
                        let target = nack.target_message_id.clone();
                        self.pending.fail_by_message(&target, nack.into_error());
                    }
                    Err(error) => warn!(%error, "nack payload unreadable"),
                }
            }
            PayloadKind::Opinion | PayloadKind::EnvironmentalState => {}
        }
    }

    /// Trust bookkeeping, conflict annotation and the persistence hook.
    async fn ingest(&self, envelope: &Envelope, knowledge: IngestedKnowledge) {
        let fact = knowledge.fact();
        self.trust.note_seen(&envelope.sender_id, self.clock.now());
        match self.conflict.observe(fact) {
            Resolution::NoConflict => {}
            resolution => debug!(fact_id = %fact.id, ?resolution, "overlapping fact resolved"),
        }
        let Some(sink) = &self.fact_sink else {
            return;
        };
        let ingested = IngestedFact {
            message_id: envelope.message_id.clone(),
            sender_id: envelope.sender_id.clone(),
            message_type: envelope.message_type.clone(),
            received_at: self.clock.now(),
            effective_confidence: self.trust.effective_confidence(fact),
            knowledge,
        };
        if let Err(error) = sink.ingest(ingested).await {
            warn!(message_id = %envelope.message_id, %error, "fact sink rejected fact");
        }
    }

    /// Queue the envelope on every matching subscriber. When the sender
    /// asked for an ACK, returns one completion per handler.
    async fn deliver(
        &self,
        envelope: &Arc<Envelope>,
        topic: &str,
    ) -> Vec<oneshot::Receiver<HspResult<()>>> {
        let targets: Vec<(SubscriptionId, mpsc::Sender<Delivery>)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|subscriber| subscriber.selector.matches(envelope, topic))
            .map(|subscriber| (subscriber.id, subscriber.sender.clone()))
            .collect();

        let mut completions = Vec::new();
        for (id, sender) in targets {
            let (done, completion) = if envelope.requires_ack() {
                let (done, completion) = oneshot::channel();
                (Some(done), Some(completion))
            } else {
                (None, None)
            };
            let delivery = Delivery {
                envelope: Arc::clone(envelope),
                done,
            };
            if sender.send(delivery).await.is_err() {
                debug!(subscription = %id, "subscriber closed");
                continue;
            }
            completions.extend(completion);
        }
        completions
    }

    fn acknowledge_after(
        self: &Arc<Self>,
        envelope: Arc<Envelope>,
        completions: Vec<oneshot::Receiver<HspResult<()>>>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut failure: Option<HspError> = None;
            for completion in completions {
                let outcome = completion
                    .await
                    .unwrap_or_else(|_| Err(HspError::handler("handler stopped before finishing")));
                if let Err(error) = outcome
                    && failure.is_none()
                {
                    failure = Some(error);
                }
            }
            let sent = match failure {
                None => inner.send_ack(&envelope.sender_id, &envelope.message_id).await,
                Some(error) => {
                    let nack = NegativeAcknowledgement::with_code(
                        envelope.message_id.clone(),
                        ErrorCode::HandlerFailed,
                        error.to_string(),
                        inner.clock.now(),
                    );
                    inner.send_nack(&envelope.sender_id, nack).await
                }
            };
            if let Err(error) = sent {
                warn!(message_id = %envelope.message_id, %error, "acknowledgement not sent");
            }
        });
    }

    async fn register_filter(&self, filter: &str) -> HspResult<()> {
        let inbound = self.inbound_tx.lock().clone();
        match inbound {
            Some(inbound) => self.fallback.subscribe(filter, inbound).await,
            None => Ok(()),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for subscriber in self.subscribers.get_mut().drain(..) {
            subscriber.task.abort();
        }
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut inbound: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(frame).await;
    }
    debug!("dispatch loop stopped");
}

/// The façade applications use to speak HSP.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn builder(agent_id: impl Into<AgentId>) -> ConnectorBuilder {
        ConnectorBuilder::new(agent_id)
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn trust(&self) -> &Arc<TrustManager> {
        &self.inner.trust
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    pub fn conflict(&self) -> &Arc<ConflictResolver> {
        &self.inner.conflict
    }

    pub fn transport_status(&self) -> Vec<AdapterStatus> {
        self.inner.fallback.status()
    }

    pub fn active_transport(&self) -> Option<String> {
        self.inner.fallback.active()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Inbound requests this agent can still answer.
    pub fn open_inbound_requests(&self) -> usize {
        self.inner.inbound_requests.lock().len()
    }

    /// ACK state of a sent message that asked for acknowledgement.
    pub fn delivery_state(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.inner.acks.lock().state(message_id)
    }

    fn ensure_connected(&self) -> HspResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(HspError::Closed(format!(
                "connector {} is not connected",
                self.inner.agent_id
            )))
        }
    }

    #[instrument(skip(self), fields(agent = %self.inner.agent_id))]
    pub async fn connect(&self) -> HspResult<()> {
        let inner = &self.inner;
        if inner.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(error) = inner.fallback.connect().await {
            inner.connected.store(false, Ordering::Release);
            return Err(error);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(inner.settings.dispatch_buffer.max(1));
        *inner.inbound_tx.lock() = Some(inbound_tx.clone());
        let mut filters = core_filters(&inner.agent_id);
        filters.extend(inner.topic_filters.lock().iter().cloned());
        for filter in &filters {
            inner.fallback.subscribe(filter, inbound_tx.clone()).await?;
        }

        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(inner), inbound_rx));
        inner.fallback.start_health_monitor();
        inner.registry.start_sweeper();

        let interval = inner
            .settings
            .readvertise_interval_ms
            .map(Duration::from_millis)
            .or_else(|| (inner.registry.ttl() / 2).to_std().ok())
            .unwrap_or(Duration::from_secs(150))
            .max(Duration::from_millis(10));
        let weak = Arc::downgrade(inner);
        let housekeeping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.evict_stale_requests();
                inner.readvertise().await;
            }
        });
        inner.tasks.lock().extend([dispatcher, housekeeping]);

        inner.readvertise().await;
        info!(
            filters = filters.len(),
            active = ?inner.fallback.active(),
            "connector connected"
        );
        Ok(())
    }

    /// Stop every background task, fail outstanding requests and disconnect
    /// the transports. Idempotent.
    #[instrument(skip(self), fields(agent = %self.inner.agent_id))]
    pub async fn close(&self) {
        let inner = &self.inner;
        let was_connected = inner.connected.swap(false, Ordering::AcqRel);
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        *inner.inbound_tx.lock() = None;
        let subscribers: Vec<Subscriber> = inner.subscribers.lock().drain(..).collect();
        for subscriber in subscribers {
            subscriber.task.abort();
        }
        inner.pending.close();
        inner.registry.close();
        if was_connected {
            inner.fallback.close().await;
            info!("connector closed");
        }
    }

    /// Publish any payload. `target` is a topic or an agent id.
    pub async fn publish<T: Serialize>(
        &self,
        kind: PayloadKind,
        target: &str,
        payload: &T,
        qos: Option<Qos>,
    ) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let mut outbound = Outbound::addressed(kind, target);
        outbound.qos = qos;
        Ok(self.inner.send(outbound, payload).await?.message_id)
    }

    #[instrument(skip(self, fact), fields(fact_id = %fact.id))]
    pub async fn publish_fact(&self, fact: &Fact) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let outbound = Outbound::broadcast(PayloadKind::Fact, topics::facts(&self.inner.agent_id));
        Ok(self.inner.send(outbound, fact).await?.message_id)
    }

    pub async fn publish_belief(&self, belief: &Belief) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let outbound =
            Outbound::broadcast(PayloadKind::Belief, topics::beliefs(&self.inner.agent_id));
        Ok(self.inner.send(outbound, belief).await?.message_id)
    }

    pub async fn publish_opinion(&self, opinion: &Opinion) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let outbound =
            Outbound::broadcast(PayloadKind::Opinion, topics::opinions(&self.inner.agent_id));
        Ok(self.inner.send(outbound, opinion).await?.message_id)
    }

    pub async fn publish_environment_state(
        &self,
        state: &EnvironmentalState,
    ) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let outbound = Outbound::broadcast(
            PayloadKind::EnvironmentalState,
            topics::environment_state(&self.inner.agent_id),
        );
        Ok(self.inner.send(outbound, state).await?.message_id)
    }

    /// Publish one of this agent's capabilities and keep re-advertising it.
    #[instrument(skip(self, ad), fields(capability = %ad.capability_id))]
    pub async fn advertise_capability(&self, ad: CapabilityAdvertisement) -> HspResult<MessageId> {
        self.ensure_connected()?;
        if ad.agent_id != self.inner.agent_id {
            return Err(HspError::Schema(format!(
                "cannot advertise capability {} for agent {}",
                ad.capability_id, ad.agent_id
            )));
        }
        self.inner
            .capabilities
            .lock()
            .insert(ad.capability_id.clone(), ad.clone());
        self.inner.advertise(&ad).await
    }

    pub fn discover(&self, query: &DiscoveryQuery) -> Vec<CapabilityAdvertisement> {
        self.inner.registry.discover(query)
    }

    /// Send `request` to an agent id or a topic and return a handle to its
    /// eventual result.
    #[instrument(skip(self, request), fields(request_id = %request.request_id, target = %target))]
    pub async fn send_task_request(
        &self,
        mut request: TaskRequest,
        target: &str,
    ) -> HspResult<PendingTask> {
        self.ensure_connected()?;
        let inner = &self.inner;
        let target_agent = (!topics::is_topic(target)).then(|| AgentId::from(target));
        if target_agent.is_some() {
            request.target_id = target_agent.clone();
        }
        request.requester_id = inner.agent_id.clone();

        let request_id = request.request_id.clone();
        let message_id = MessageId::generate();
        let receiver = inner
            .pending
            .reserve(request_id.clone(), message_id.clone(), target_agent)?;

        let timeout = match request.deadline {
            Some(deadline) => (deadline - inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => inner.settings.request_timeout(),
        };
        let mut outbound = Outbound::addressed(PayloadKind::TaskRequest, target);
        outbound.pattern = Pattern::Request;
        outbound.message_id = Some(message_id.clone());
        outbound.qos = Some(Qos {
            priority: request.priority.unwrap_or_default(),
            requires_ack: inner.settings.ack_requests,
            ttl_seconds: None,
        });
        if let Err(error) = inner.send(outbound, &request).await {
            inner.pending.discard(&request_id);
            return Err(error);
        }

        let weak = Arc::downgrade(inner);
        let expiring = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_request(&expiring);
            }
        });
        inner.pending.arm(&request_id, timer);

        Ok(PendingTask::new(request_id, message_id, receiver))
    }

    /// Answer a request this agent received. Only one terminal result is
    /// accepted per request.
    #[instrument(skip(self, result), fields(request_id = %result.request_id, status = ?result.status))]
    pub async fn send_task_result(&self, mut result: TaskResult) -> HspResult<MessageId> {
        self.ensure_connected()?;
        let inner = &self.inner;
        let terminal = result.status.is_terminal();
        let now = inner.clock.now();
        let origin = {
            let mut inbound = inner.inbound_requests.lock();
            let origin = inbound
                .get(&result.request_id)
                .filter(|origin| origin.expires_at > now)
                .cloned();
            let Some(origin) = origin else {
                inbound.remove(&result.request_id);
                return Err(HspError::UnknownRequest(result.request_id.clone()));
            };
            if terminal {
                inbound.remove(&result.request_id);
            }
            origin
        };
        result.executor_id = inner.agent_id.clone();

        let outbound = Outbound::reply(
            PayloadKind::TaskResult,
            &origin.requester,
            topics::results(&origin.requester),
            origin.message_id.clone(),
        );
        match inner.send(outbound, &result).await {
            Ok(envelope) => Ok(envelope.message_id),
            Err(error) => {
                if terminal {
                    inner
                        .inbound_requests
                        .lock()
                        .insert(result.request_id.clone(), origin);
                }
                Err(error)
            }
        }
    }

    /// Idempotent; true only when a request was actually cancelled.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let cancelled = self.inner.pending.cancel(request_id);
        if cancelled {
            info!(request_id = %request_id, "task request cancelled");
        }
        cancelled
    }

    /// Route envelopes matching `selector` to `handler`.
    ///
    /// `selector` is `*`, a message type (`HSP::Fact` or `HSP::Fact_v0.1`) or
    /// a topic filter. Topic filters are also registered on the transports.
    pub async fn subscribe(
        &self,
        selector: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> HspResult<SubscriptionId> {
        let selector = Selector::parse(selector)?;
        let inner = &self.inner;
        let id = SubscriptionId(inner.next_subscription.fetch_add(1, Ordering::Relaxed));

        if let Some(filter) = selector.topic_filter() {
            let known = {
                let mut filters = inner.topic_filters.lock();
                let known = filters.iter().any(|existing| existing == filter);
                if !known {
                    filters.push(filter.to_owned());
                }
                known
            };
            if !known {
                inner.register_filter(filter).await?;
            }
        }

        let (sender, mut receiver) = mpsc::channel::<Delivery>(inner.settings.subscriber_buffer.max(1));
        let task = tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let outcome = handler.handle(Arc::clone(&delivery.envelope)).await;
                if let Err(error) = &outcome {
                    warn!(
                        subscription = %id,
                        message_id = %delivery.envelope.message_id,
                        %error,
                        "handler failed"
                    );
                }
                if let Some(done) = delivery.done {
                    let _ = done.send(outcome);
                }
            }
        });
        inner.subscribers.lock().push(Subscriber {
            id,
            selector,
            sender,
            task,
        });
        debug!(subscription = %id, "handler subscribed");
        Ok(id)
    }

    /// Stop routing to a subscription. Already queued envelopes still run.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        before != subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use hsp_conflict::FactStatus;
    use hsp_protocol::{ManualClock, Statement};
    use hsp_transport::{MemoryBus, MemoryTransport};
    use serde_json::{Value, json};

    use super::*;
    use crate::handler::handler_fn;

    fn agent(id: &str, bus: &MemoryBus) -> ConnectorBuilder {
        Connector::builder(id).transport(Arc::new(MemoryTransport::new("memory", bus.clone())), 0)
    }

    async fn connected(builder: ConnectorBuilder) -> anyhow::Result<Connector> {
        let connector = builder.build()?;
        connector.connect().await?;
        Ok(connector)
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) -> anyhow::Result<()> {
        for _ in 0..300 {
            if check() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timed out waiting for {what}")
    }

    fn counting_handler(count: &Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        let count = Arc::clone(count);
        handler_fn(move |_envelope: Arc<Envelope>| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HspError>(())
            }
        })
    }

    /// Answers `{"a": x, "b": y}` with `{"value": x + y}`.
    fn adder(executor: &Connector) -> Arc<dyn MessageHandler> {
        let executor = executor.clone();
        handler_fn(move |envelope: Arc<Envelope>| {
            let executor = executor.clone();
            async move {
                let request: TaskRequest = envelope.decode_payload()?;
                let sum = request.parameters["a"].as_i64().unwrap_or(0)
                    + request.parameters["b"].as_i64().unwrap_or(0);
                let result = TaskResult::success(
                    request.request_id,
                    executor.agent_id().clone(),
                    json!({ "value": sum }),
                );
                executor.send_task_result(result).await?;
                Ok::<_, HspError>(())
            }
        })
    }

    async fn raw_transport(bus: &MemoryBus) -> anyhow::Result<MemoryTransport> {
        let raw = MemoryTransport::new("raw", bus.clone());
        raw.connect().await?;
        Ok(raw)
    }

    fn sealed_fact(sender: &str, draft_qos: Option<Qos>) -> anyhow::Result<Envelope> {
        let fact = Fact::new(
            AgentId::from(sender),
            Statement::triple("door", "state", json!("open")),
            0.7,
        );
        let draft = EnvelopeDraft::for_payload(
            AgentId::from(sender),
            topics::facts(&AgentId::from(sender)),
            PayloadKind::Fact,
            Pattern::Publish,
            &fact,
        )?
        .with_qos(draft_qos);
        Ok(Codec::default().seal(draft, FillPolicy::FillMissing, &SystemClock)?)
    }

    #[derive(Default)]
    struct RecordingSink {
        facts: Mutex<Vec<IngestedFact>>,
    }

    #[async_trait]
    impl FactSink for RecordingSink {
        async fn ingest(&self, fact: IngestedFact) -> HspResult<()> {
            self.facts.lock().push(fact);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        timings: Mutex<Vec<(&'static str, String)>>,
    }

    impl MetricsSink for RecordingMetrics {
        fn increment(&self, _counter: &'static str, _label: &str) {}

        fn observe_ms(&self, histogram: &'static str, label: &str, _millis: u64) {
            self.timings.lock().push((histogram, label.to_owned()));
        }
    }

    #[tokio::test]
    async fn build_requires_a_transport() {
        let error = Connector::builder("A").build().err().map(|error| error.code());
        assert_eq!(error, Some(ErrorCode::Config));
    }

    #[tokio::test]
    async fn publishing_before_connect_is_rejected() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = agent("A", &bus).build()?;
        let fact = Fact::new(
            AgentId::from("A"),
            Statement::triple("x", "y", json!(1)),
            1.0,
        );
        let error = a.publish_fact(&fact).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn advertised_capability_is_discoverable_by_peers() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let b = connected(agent("B", &bus)).await?;

        let ad = CapabilityAdvertisement::new(
            CapabilityId::from("calc-1"),
            AgentId::from("B"),
            "calculator",
            "1.0",
        )
        .with_tags(["math"]);
        b.advertise_capability(ad).await?;

        eventually("calc-1 in A's registry", || {
            !a.discover(&DiscoveryQuery::by_name("calculator")).is_empty()
        })
        .await?;
        let found = a.discover(&DiscoveryQuery::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].capability_id.as_str(), "calc-1");
        assert_eq!(found[0].agent_id.as_str(), "B");
        assert_eq!(
            a.discover(&DiscoveryQuery::default().with_tags(["math"]))
                .len(),
            1
        );

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn foreign_advertisement_is_refused() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let ad = CapabilityAdvertisement::new(
            CapabilityId::from("calc-1"),
            AgentId::from("B"),
            "calculator",
            "1.0",
        );
        assert_eq!(
            a.advertise_capability(ad).await.unwrap_err().code(),
            ErrorCode::Schema
        );
        a.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn task_request_round_trip_is_acknowledged() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let b = connected(agent("B", &bus)).await?;
        b.subscribe("HSP::TaskRequest", adder(&b)).await?;

        let request = TaskRequest::new("r1", "A", json!({ "a": 2, "b": 2 }));
        let pending = a.send_task_request(request, "B").await?;
        let message_id = pending.message_id().clone();
        assert_eq!(a.outstanding_requests(), 1);

        let result = pending.wait().await?;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.payload, Some(json!({ "value": 4 })));
        assert_eq!(result.executor_id.as_str(), "B");
        assert_eq!(a.outstanding_requests(), 0);

        eventually("ACK from B", || {
            a.delivery_state(&message_id) == Some(DeliveryState::Acknowledged)
        })
        .await?;
        assert!(a.trust().score(&AgentId::from("B")) > a.trust().neutral());

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected_while_outstanding() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;

        let _first = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "nobody")
            .await?;
        let second = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "nobody")
            .await;
        let code = second.err().map(|error| error.code());
        assert_eq!(code, Some(ErrorCode::DuplicateRequest));
        assert_eq!(a.outstanding_requests(), 1);

        a.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_costs_trust() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let settings = ConnectorSettings {
            request_timeout_ms: 50,
            ..ConnectorSettings::default()
        };
        let a = connected(agent("A", &bus).settings(settings)).await?;

        let pending = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "nobody")
            .await?;
        let error = pending.wait().await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert!(a.trust().score(&AgentId::from("nobody")) < a.trust().neutral());
        assert_eq!(a.outstanding_requests(), 0);

        a.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn cancel_settles_the_pending_task_once() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;

        let pending = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "nobody")
            .await?;
        let request_id = pending.request_id().clone();
        assert!(a.cancel(&request_id));
        assert!(!a.cancel(&request_id));
        assert_eq!(pending.wait().await.unwrap_err().code(), ErrorCode::Cancelled);

        a.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn second_terminal_result_is_refused() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let b = connected(agent("B", &bus)).await?;

        let refusals = Arc::new(Mutex::new(Vec::new()));
        let executor = b.clone();
        let seen = Arc::clone(&refusals);
        b.subscribe(
            "HSP::TaskRequest",
            handler_fn(move |envelope: Arc<Envelope>| {
                let executor = executor.clone();
                let seen = Arc::clone(&seen);
                async move {
                    let request: TaskRequest = envelope.decode_payload()?;
                    let first = TaskResult::success(request.request_id.clone(), "B", json!(1));
                    executor.send_task_result(first).await?;
                    let second = TaskResult::success(request.request_id, "B", json!(2));
                    if let Err(error) = executor.send_task_result(second).await {
                        seen.lock().push(error.code());
                    }
                    Ok::<_, HspError>(())
                }
            }),
        )
        .await?;

        let pending = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "B")
            .await?;
        assert_eq!(pending.wait().await?.payload, Some(json!(1)));
        eventually("second result refused", || !refusals.lock().is_empty()).await?;
        assert_eq!(refusals.lock().as_slice(), &[ErrorCode::UnknownRequest]);

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn failing_handler_nacks_the_request() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let b = connected(agent("B", &bus)).await?;
        b.subscribe(
            "HSP::TaskRequest",
            handler_fn(|_envelope: Arc<Envelope>| async move {
                Err::<(), _>(HspError::handler("calculator offline"))
            }),
        )
        .await?;

        let pending = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "B")
            .await?;
        let message_id = pending.message_id().clone();
        match pending.wait().await {
            Err(HspError::Nacked { code, .. }) => assert_eq!(code, "HSP_HANDLER_FAILED"),
            other => anyhow::bail!("expected a NACK, got {other:?}"),
        }
        assert!(matches!(
            a.delivery_state(&message_id),
            Some(DeliveryState::Rejected { ref code, .. }) if code == "HSP_HANDLER_FAILED"
        ));
        assert!(a.trust().score(&AgentId::from("B")) < a.trust().neutral());

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_facts_resolve_by_effective_confidence() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let sink = Arc::new(RecordingSink::default());
        let a = connected(agent("A", &bus).fact_sink(sink.clone())).await?;
        a.trust().seed(AgentId::from("B"), 0.8);
        a.trust().seed(AgentId::from("C"), 0.95);
        let b = connected(agent("B", &bus)).await?;
        let c = connected(agent("C", &bus)).await?;

        let blue = Fact::new(
            AgentId::from("B"),
            Statement::triple("sky", "color", json!("blue")),
            0.9,
        );
        b.publish_fact(&blue).await?;
        eventually("B's fact ingested", || sink.facts.lock().len() == 1).await?;

        let green = Fact::new(
            AgentId::from("C"),
            Statement::triple("sky", "color", json!("green")),
            0.6,
        );
        c.publish_fact(&green).await?;
        eventually("C's fact ingested", || sink.facts.lock().len() == 2).await?;

        let ingested = sink.facts.lock().clone();
        assert!((ingested[0].effective_confidence - 0.72).abs() < 1e-9);
        assert!((ingested[1].effective_confidence - 0.57).abs() < 1e-9);
        assert_eq!(
            a.conflict().status(&green.id),
            Some(FactStatus::SupersededBy {
                fact_id: blue.id.clone()
            })
        );
        let prevailing = a.conflict().prevailing("sky", "color");
        assert_eq!(prevailing.map(|fact| fact.id), Some(blue.id));

        for connector in [a, b, c] {
            connector.close().await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn publish_fails_over_to_backup_transport() -> anyhow::Result<()> {
        let primary = MemoryBus::default();
        let backup = MemoryBus::default();
        let policy = FallbackPolicy {
            demote_after: 1,
            ..FallbackPolicy::default()
        };
        let two_wires = |id: &str| {
            Connector::builder(id)
                .transport(Arc::new(MemoryTransport::new("primary", primary.clone())), 0)
                .transport(Arc::new(MemoryTransport::new("backup", backup.clone())), 1)
                .fallback_policy(policy.clone())
        };
        let a = connected(two_wires("A")).await?;
        let b = connected(two_wires("B")).await?;
        let received = Arc::new(AtomicUsize::new(0));
        b.subscribe("HSP::Fact", counting_handler(&received)).await?;

        primary.set_available(false);
        let fact = Fact::new(
            AgentId::from("A"),
            Statement::triple("door", "state", json!("closed")),
            0.9,
        );
        a.publish_fact(&fact).await?;

        eventually("fact over backup", || received.load(Ordering::SeqCst) == 1).await?;
        assert_eq!(a.active_transport().as_deref(), Some("backup"));
        let primary_state = a
            .transport_status()
            .into_iter()
            .find(|status| status.name == "primary")
            .map(|status| status.state);
        assert_ne!(primary_state, Some(hsp_fallback::HealthState::Healthy));

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn own_messages_are_not_delivered_locally() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let b = connected(agent("B", &bus)).await?;
        let mine = Arc::new(AtomicUsize::new(0));
        let theirs = Arc::new(AtomicUsize::new(0));
        a.subscribe("*", counting_handler(&mine)).await?;
        b.subscribe("hsp/knowledge/facts/+", counting_handler(&theirs))
            .await?;

        let fact = Fact::new(
            AgentId::from("A"),
            Statement::triple("x", "y", json!(true)),
            0.5,
        );
        a.publish_fact(&fact).await?;
        eventually("B received", || theirs.load(Ordering::SeqCst) == 1).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mine.load(Ordering::SeqCst), 0);

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_bytes_reach_handlers_once() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let b = connected(agent("B", &bus)).await?;
        let received = Arc::new(AtomicUsize::new(0));
        b.subscribe("HSP::Fact", counting_handler(&received)).await?;

        let raw = raw_transport(&bus).await?;
        let envelope = sealed_fact("X", None)?;
        let bytes = Codec::default().encode(&envelope)?;
        let topic = topics::facts(&AgentId::from("X"));
        raw.publish(&topic, &bytes).await?;
        raw.publish(&topic, &bytes).await?;

        eventually("first copy", || received.load(Ordering::SeqCst) == 1).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn expired_envelopes_are_dropped() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let b = connected(agent("B", &bus)).await?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        b.subscribe(
            "HSP::Fact",
            handler_fn(move |envelope: Arc<Envelope>| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(envelope.message_id.clone());
                    Ok::<_, HspError>(())
                }
            }),
        )
        .await?;

        let raw = raw_transport(&bus).await?;
        let codec = Codec::default();
        let short_lived = Some(Qos {
            ttl_seconds: Some(60),
            ..Qos::default()
        });
        let mut stale = sealed_fact("X", short_lived.clone())?;
        stale.sent_at = chrono::Utc::now() - chrono::Duration::hours(1);
        let fresh = sealed_fact("X", short_lived)?;
        let topic = topics::facts(&AgentId::from("X"));
        raw.publish(&topic, &codec.encode(&stale)?).await?;
        raw.publish(&topic, &codec.encode(&fresh)?).await?;

        eventually("fresh fact", || !seen.lock().is_empty()).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen.lock().as_slice(), &[fresh.message_id]);

        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_version_is_nacked_to_the_sender() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let b = connected(agent("B", &bus)).await?;

        let raw = raw_transport(&bus).await?;
        let (acks_tx, mut acks_rx) = mpsc::channel(8);
        raw.subscribe(&topics::acks(&AgentId::from("X")), acks_tx)
            .await?;

        let envelope = sealed_fact("X", None)?;
        let mut value = serde_json::to_value(&envelope)?;
        value["envelope_version"] = json!("9.9");
        let bytes = serde_json::to_vec(&value)?;
        raw.publish(&topics::requests(&AgentId::from("B")), &bytes)
            .await?;

        let frame = tokio::time::timeout(Duration::from_secs(3), acks_rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("ack channel closed"))?;
        let reply = Codec::default().decode(&frame.bytes)?;
        assert!(reply.message_type.is(PayloadKind::NegativeAcknowledgement));
        assert_eq!(reply.correlation_id.as_ref(), Some(&envelope.message_id));
        let nack: NegativeAcknowledgement = reply.decode_payload()?;
        assert_eq!(nack.error_code, "HSP_UNSUPPORTED_VERSION");
        assert_eq!(nack.target_message_id, envelope.message_id);

        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let a = connected(agent("A", &bus)).await?;
        let pending = a
            .send_task_request(TaskRequest::new("r1", "A", Value::Null), "nobody")
            .await?;
        a.close().await;
        a.close().await;
        assert!(!a.is_connected());
        assert_eq!(pending.wait().await.unwrap_err().code(), ErrorCode::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn unanswered_inbound_requests_are_evicted_after_expiry() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let clock = Arc::new(ManualClock::default());
        let settings = ConnectorSettings {
            request_timeout_ms: 1_000,
            readvertise_interval_ms: Some(20),
            ..ConnectorSettings::default()
        };
        let b = connected(agent("B", &bus).settings(settings).clock(clock.clone())).await?;
        let a = connected(agent("A", &bus)).await?;

        for index in 0..5 {
            let request = TaskRequest::new(format!("r{index}"), "A", Value::Null);
            a.send_task_request(request, "B").await?;
        }
        eventually("requests registered", || b.open_inbound_requests() == 5).await?;

        clock.advance(chrono::Duration::seconds(2));
        eventually("requests evicted", || b.open_inbound_requests() == 0).await?;
        let late = b
            .send_task_result(TaskResult::success("r0", "B", json!(0)))
            .await;
        assert_eq!(
            late.err().map(|error| error.code()),
            Some(ErrorCode::UnknownRequest)
        );

        a.close().await;
        b.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn publish_latency_is_reported() -> anyhow::Result<()> {
        let bus = MemoryBus::default();
        let metrics = Arc::new(RecordingMetrics::default());
        let a = connected(agent("A", &bus).metrics(metrics.clone())).await?;

        let fact = Fact::new(
            AgentId::from("A"),
            Statement::triple("x", "y", json!(1)),
            1.0,
        );
        a.publish_fact(&fact).await?;
        assert!(
            metrics
                .timings
                .lock()
                .contains(&("hsp.publish.latency", "Fact".to_owned()))
        );

        a.close().await;
        Ok(())
    }
}
