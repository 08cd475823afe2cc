//! Knowledge payloads: facts, beliefs and opinions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, FactId};

/// What a fact asserts.
///
/// Either free text or a structured subject/predicate/object triple. Only
/// triples can overlap semantically (same subject and predicate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Statement {
    Triple {
        subject: String,
        predicate: String,
        object: Value,
    },
    Text(String),
}

impl Statement {
    pub fn triple(subject: impl Into<String>, predicate: impl Into<String>, object: Value) -> Self {
        Self::Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
        }
    }

    /// `(subject, predicate)` for triples, `None` for free text.
    pub fn overlap_key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Triple {
                subject, predicate, ..
            } => Some((subject.as_str(), predicate.as_str())),
            Self::Text(_) => None,
        }
    }

    pub fn object(&self) -> Option<&Value> {
        match self {
            Self::Triple { object, .. } => Some(object),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub statement: Statement,
    pub source_id: AgentId,
    pub created_at: DateTime<Utc>,
    /// Stated confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Source facts of a derived (merged) fact.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_from: Vec<FactId>,
}

impl Fact {
    pub fn new(source_id: AgentId, statement: Statement, confidence: f64) -> Self {
        Self {
            id: FactId::new_uuid(),
            statement,
            source_id,
            created_at: Utc::now(),
            confidence,
            valid_from: None,
            valid_until: None,
            weight: None,
            tags: Vec::new(),
            derived_from: Vec::new(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Confidence clamped into `[0, 1]`; NaN counts as zero.
    pub fn bounded_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| at >= from)
            && self.valid_until.is_none_or(|until| at <= until)
    }
}

/// A fact as held by a particular agent, with its justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    #[serde(flatten)]
    pub fact: Fact,
    pub holder_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Agree,
    Disagree,
    Uncertain,
}

/// One agent's stance on a fact published by another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    pub id: FactId,
    pub holder_id: AgentId,
    pub about_fact_id: FactId,
    pub stance: Stance,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}
