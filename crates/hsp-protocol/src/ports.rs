//! Collaborator ports consumed by the HSP core.
//!
//! These traits are the only boundary between the runtime and the systems it
//! serves: a clock (injectable for tests), a fire-and-forget metrics sink and
//! a persistence hook through which the memory subsystem receives ingested
//! facts. The core never persists anything itself.
//!
//! Object-safety note: async ports use `async-trait` for dyn dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::HspResult;
use crate::envelope::MessageType;
use crate::ids::{AgentId, MessageId};
use crate::knowledge::{Belief, Fact};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fire-and-forget counters and timings.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: &'static str, label: &str);
    fn observe_ms(&self, histogram: &'static str, label: &str, millis: u64);
}

/// Emits every metric as a `trace`-level tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, counter: &'static str, label: &str) {
        trace!(counter, label, "metric.increment");
    }

    fn observe_ms(&self, histogram: &'static str, label: &str, millis: u64) {
        trace!(histogram, label, millis, "metric.observe");
    }
}

/// Knowledge handed to the persistence hook after protocol processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestedKnowledge {
    Fact(Fact),
    Belief(Belief),
}

impl IngestedKnowledge {
    pub fn fact(&self) -> &Fact {
        match self {
            Self::Fact(fact) => fact,
            Self::Belief(belief) => &belief.fact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedFact {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
    /// `confidence * trust(source)` at ingestion time.
    pub effective_confidence: f64,
    pub knowledge: IngestedKnowledge,
}

/// Persistence hook the memory subsystem implements to receive facts.
#[async_trait]
pub trait FactSink: Send + Sync {
    async fn ingest(&self, fact: IngestedFact) -> HspResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(301));
        assert_eq!(clock.now(), start + Duration::seconds(301));
    }
}
