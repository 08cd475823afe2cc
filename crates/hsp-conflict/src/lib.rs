//! Conflict metadata for overlapping facts.
//!
//! Two facts overlap when both are triples with the same subject and
//! predicate. The resolver keeps one prevailing fact per overlap key and,
//! when a new fact disagrees with it, applies the configured strategy. It
//! never deletes a fact: losers are annotated, merges derive a new fact
//! that names its sources, and every decision lands in the history.
//!
//! Tracked facts and their statuses live as long as the resolver. The
//! history is a rolling log capped at [`ConflictConfig::history_capacity`];
//! the oldest annotations rotate out first, while the outcome they recorded
//! stays on each fact's [`FactStatus`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hsp_protocol::{AgentId, Clock, Fact, FactId, Statement};
use hsp_trust::TrustManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    NewestWins,
    #[default]
    HighestEffectiveConfidenceSupersede,
    TrustWeightedMerge,
    LoggedContradiction,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NewestWins => "NEWEST_WINS",
            Self::HighestEffectiveConfidenceSupersede => "HIGHEST_EFFECTIVE_CONFIDENCE_SUPERSEDE",
            Self::TrustWeightedMerge => "TRUST_WEIGHTED_MERGE",
            Self::LoggedContradiction => "LOGGED_CONTRADICTION",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
    /// Effective confidences closer than this are a tie.
    pub epsilon: f64,
    /// Most recent annotations kept by [`ConflictResolver::history`].
    pub history_capacity: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            epsilon: 1e-6,
            history_capacity: 1024,
        }
    }
}

/// Where a fact stands after conflict processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FactStatus {
    Prevailing,
    Corroborates { fact_id: FactId },
    SupersededBy { fact_id: FactId },
    MergedInto { fact_id: FactId },
    Contradicts { fact_id: FactId },
}

/// Outcome of observing one fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    NoConflict,
    Corroborated {
        existing: FactId,
    },
    Superseded {
        winner: FactId,
        loser: FactId,
        strategy: ConflictStrategy,
    },
    Merged {
        derived: Box<Fact>,
    },
    Contradiction {
        existing: FactId,
        incoming: FactId,
    },
}

/// One recorded conflict decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub at: DateTime<Utc>,
    pub subject: String,
    pub predicate: String,
    pub existing: FactId,
    pub incoming: FactId,
    /// Strategy actually applied, which differs from the configured one when
    /// a merge falls back to supersession.
    pub strategy: ConflictStrategy,
    pub resolution: Resolution,
}

#[derive(Debug, Default)]
struct State {
    facts: HashMap<FactId, (Fact, FactStatus)>,
    prevailing: HashMap<(String, String), FactId>,
    history: VecDeque<Annotation>,
}

pub struct ConflictResolver {
    local_id: AgentId,
    config: ConflictConfig,
    trust: Arc<TrustManager>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl ConflictResolver {
    /// `local_id` becomes the source of facts derived by merging.
    pub fn new(
        local_id: AgentId,
        config: ConflictConfig,
        trust: Arc<TrustManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local_id,
            config,
            trust,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.config.strategy
    }

    /// Track `fact` and resolve it against the prevailing fact with the same
    /// subject and predicate.
    pub fn observe(&self, fact: &Fact) -> Resolution {
        let mut state = self.state.lock();
        if state.facts.contains_key(&fact.id) {
            return Resolution::NoConflict;
        }
        let Some((subject, predicate)) = fact.statement.overlap_key() else {
            state
                .facts
                .insert(fact.id.clone(), (fact.clone(), FactStatus::Prevailing));
            return Resolution::NoConflict;
        };
        let key = (subject.to_owned(), predicate.to_owned());

        let existing = state
            .prevailing
            .get(&key)
            .and_then(|id| state.facts.get(id))
            .map(|(existing, _)| existing.clone());
        let Some(existing) = existing else {
            state.prevailing.insert(key, fact.id.clone());
            state
                .facts
                .insert(fact.id.clone(), (fact.clone(), FactStatus::Prevailing));
            return Resolution::NoConflict;
        };

        let (strategy, resolution) = if existing.statement.object() == fact.statement.object() {
            (
                self.config.strategy,
                Resolution::Corroborated {
                    existing: existing.id.clone(),
                },
            )
        } else {
            self.resolve(&existing, fact)
        };

        self.apply(&mut state, &key, &existing, fact, &resolution);
        if self.config.history_capacity == 0 {
            return resolution;
        }
        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(Annotation {
            at: self.clock.now(),
            subject: key.0.clone(),
            predicate: key.1.clone(),
            existing: existing.id.clone(),
            incoming: fact.id.clone(),
            strategy,
            resolution: resolution.clone(),
        });
        resolution
    }

    fn resolve(&self, existing: &Fact, incoming: &Fact) -> (ConflictStrategy, Resolution) {
        match self.config.strategy {
            ConflictStrategy::NewestWins => {
                let (winner, loser) = if existing.created_at > incoming.created_at {
                    (existing, incoming)
                } else {
                    (incoming, existing)
                };
                (
                    ConflictStrategy::NewestWins,
                    superseded(winner, loser, ConflictStrategy::NewestWins),
                )
            }
            ConflictStrategy::HighestEffectiveConfidenceSupersede => (
                ConflictStrategy::HighestEffectiveConfidenceSupersede,
                self.by_confidence(existing, incoming),
            ),
            ConflictStrategy::TrustWeightedMerge => match self.merge(existing, incoming) {
                Some(derived) => (
                    ConflictStrategy::TrustWeightedMerge,
                    Resolution::Merged {
                        derived: Box::new(derived),
                    },
                ),
                None => {
                    debug!(
                        existing = %existing.id,
                        incoming = %incoming.id,
                        "objects are not numeric; superseding instead of merging"
                    );
                    (
                        ConflictStrategy::HighestEffectiveConfidenceSupersede,
                        self.by_confidence(existing, incoming),
                    )
                }
            },
            ConflictStrategy::LoggedContradiction => (
                ConflictStrategy::LoggedContradiction,
                Resolution::Contradiction {
                    existing: existing.id.clone(),
                    incoming: incoming.id.clone(),
                },
            ),
        }
    }

    fn by_confidence(&self, existing: &Fact, incoming: &Fact) -> Resolution {
        let existing_score = self.trust.effective_confidence(existing);
        let incoming_score = self.trust.effective_confidence(incoming);
        let (winner, loser) = if (existing_score - incoming_score).abs() <= self.config.epsilon {
            if existing.created_at > incoming.created_at {
                (existing, incoming)
            } else {
                (incoming, existing)
            }
        } else if existing_score > incoming_score {
            (existing, incoming)
        } else {
            (incoming, existing)
        };
        superseded(
            winner,
            loser,
            ConflictStrategy::HighestEffectiveConfidenceSupersede,
        )
    }

    /// Weighted mean of two numeric objects, weighted by effective
    /// confidence. `None` when either object is not a number.
    fn merge(&self, existing: &Fact, incoming: &Fact) -> Option<Fact> {
        let (subject, predicate) = existing.statement.overlap_key()?;
        let a = existing.statement.object()?.as_f64()?;
        let b = incoming.statement.object()?.as_f64()?;
        let wa = self.trust.effective_confidence(existing);
        let wb = self.trust.effective_confidence(incoming);
        let merged = if wa + wb > 0.0 {
            (a * wa + b * wb) / (wa + wb)
        } else {
            (a + b) / 2.0
        };
        let object = Value::Number(Number::from_f64(merged)?);

        let mut derived = Fact::new(
            self.local_id.clone(),
            Statement::triple(subject, predicate, object),
            wa.max(wb),
        )
        .with_created_at(self.clock.now());
        derived.derived_from = vec![existing.id.clone(), incoming.id.clone()];
        Some(derived)
    }

    fn apply(
        &self,
        state: &mut State,
        key: &(String, String),
        existing: &Fact,
        incoming: &Fact,
        resolution: &Resolution,
    ) {
        let set_status = |state: &mut State, fact: &Fact, status: FactStatus| {
            state
                .facts
                .entry(fact.id.clone())
                .and_modify(|(_, current)| *current = status.clone())
                .or_insert_with(|| (fact.clone(), status));
        };

        match resolution {
            Resolution::NoConflict => {}
            Resolution::Corroborated { existing: id } => {
                set_status(state, incoming, FactStatus::Corroborates { fact_id: id.clone() });
            }
            Resolution::Superseded {
                winner,
                loser,
                strategy,
            } => {
                let (winner_fact, loser_fact) = if winner == &incoming.id {
                    (incoming, existing)
                } else {
                    (existing, incoming)
                };
                set_status(state, winner_fact, FactStatus::Prevailing);
                set_status(
                    state,
                    loser_fact,
                    FactStatus::SupersededBy {
                        fact_id: winner.clone(),
                    },
                );
                state.prevailing.insert(key.clone(), winner.clone());
                info!(%winner, %loser, %strategy, "fact superseded");
            }
            Resolution::Merged { derived } => {
                let into = FactStatus::MergedInto {
                    fact_id: derived.id.clone(),
                };
                set_status(state, existing, into.clone());
                set_status(state, incoming, into);
                set_status(state, derived, FactStatus::Prevailing);
                state.prevailing.insert(key.clone(), derived.id.clone());
                info!(derived = %derived.id, "facts merged");
            }
            Resolution::Contradiction {
                existing: existing_id,
                incoming: incoming_id,
            } => {
                set_status(
                    state,
                    incoming,
                    FactStatus::Contradicts {
                        fact_id: existing_id.clone(),
                    },
                );
                warn!(
                    existing = %existing_id,
                    incoming = %incoming_id,
                    subject = %key.0,
                    predicate = %key.1,
                    "contradicting facts recorded"
                );
            }
        }
    }

    pub fn status(&self, fact_id: &FactId) -> Option<FactStatus> {
        self.state
            .lock()
            .facts
            .get(fact_id)
            .map(|(_, status)| status.clone())
    }

    pub fn prevailing(&self, subject: &str, predicate: &str) -> Option<Fact> {
        let state = self.state.lock();
        state
            .prevailing
            .get(&(subject.to_owned(), predicate.to_owned()))
            .and_then(|id| state.facts.get(id))
            .map(|(fact, _)| fact.clone())
    }

    pub fn history(&self) -> Vec<Annotation> {
        self.state.lock().history.iter().cloned().collect()
    }
}

fn superseded(winner: &Fact, loser: &Fact, strategy: ConflictStrategy) -> Resolution {
    Resolution::Superseded {
        winner: winner.id.clone(),
        loser: loser.id.clone(),
        strategy,
    }
}
