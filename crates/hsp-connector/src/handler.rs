//! Application handlers and the selectors that route envelopes to them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hsp_protocol::{Envelope, HspError, HspResult, topics};

/// Receives envelopes matching a subscription.
///
/// Returning an error NACKs envelopes that asked for acknowledgement.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<Envelope>) -> HspResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HspResult<()>> + Send,
{
    async fn handle(&self, envelope: Arc<Envelope>) -> HspResult<()> {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HspResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(handler))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `*`: every accepted envelope.
    Any,
    /// `HSP::Fact` or `HSP::Fact_v0.1`.
    MessageType(String),
    /// An MQTT-style topic filter such as `hsp/knowledge/facts/+`.
    Topic(String),
}

impl Selector {
    pub fn parse(raw: &str) -> HspResult<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self::Any);
        }
        if topics::is_topic(raw) {
            if !topics::is_valid_filter(raw) {
                return Err(HspError::Config(format!("invalid topic filter: {raw}")));
            }
            return Ok(Self::Topic(raw.to_owned()));
        }
        if raw.contains("::") {
            return Ok(Self::MessageType(raw.to_owned()));
        }
        Err(HspError::Config(format!(
            "{raw} is neither a message type nor a topic filter"
        )))
    }

    pub fn matches(&self, envelope: &Envelope, topic: &str) -> bool {
        match self {
            Self::Any => true,
            Self::MessageType(selector) => envelope.message_type.matches_selector(selector),
            Self::Topic(filter) => topics::matches(filter, topic),
        }
    }

    pub fn topic_filter(&self) -> Option<&str> {
        match self {
            Self::Topic(filter) => Some(filter),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use hsp_protocol::{
        AgentId, Codec, EnvelopeDraft, Fact, FillPolicy, Pattern, PayloadKind, Statement,
        SystemClock,
    };
    use serde_json::json;

    use super::*;

    fn fact_envelope() -> Envelope {
        let fact = Fact::new(
            AgentId::from("B"),
            Statement::triple("sky", "color", json!("blue")),
            0.8,
        );
        let draft = EnvelopeDraft::for_payload(
            AgentId::from("B"),
            "hsp/knowledge/facts/B",
            PayloadKind::Fact,
            Pattern::Publish,
            &fact,
        )
        .unwrap();
        Codec::default()
            .seal(draft, FillPolicy::FillMissing, &SystemClock)
            .unwrap()
    }

    #[test]
    fn parses_each_selector_form() {
        assert_eq!(Selector::parse("*").unwrap(), Selector::Any);
        assert_eq!(
            Selector::parse("HSP::Fact").unwrap(),
            Selector::MessageType("HSP::Fact".to_owned())
        );
        assert_eq!(
            Selector::parse("hsp/knowledge/facts/+").unwrap(),
            Selector::Topic("hsp/knowledge/facts/+".to_owned())
        );
        assert!(Selector::parse("hsp/#/facts").is_err());
        assert!(Selector::parse("facts").is_err());
    }

    #[test]
    fn selectors_match_type_and_topic() {
        let envelope = fact_envelope();
        let topic = "hsp/knowledge/facts/B";
        assert!(Selector::Any.matches(&envelope, topic));
        assert!(Selector::parse("HSP::Fact").unwrap().matches(&envelope, topic));
        assert!(Selector::parse("HSP::Fact_v0.1").unwrap().matches(&envelope, topic));
        assert!(!Selector::parse("HSP::Belief").unwrap().matches(&envelope, topic));
        assert!(Selector::parse("hsp/knowledge/#").unwrap().matches(&envelope, topic));
        assert!(!Selector::parse("hsp/requests/+").unwrap().matches(&envelope, topic));
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|envelope: Arc<Envelope>| async move {
            if envelope.sender_id.as_str() == "B" {
                Ok(())
            } else {
                Err(HspError::handler("unexpected sender"))
            }
        });
        assert!(handler.handle(Arc::new(fact_envelope())).await.is_ok());
    }
}
