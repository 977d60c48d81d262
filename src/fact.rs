//! Timestamped fact model shared by every windowing and aggregation stage.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Timestamp = DateTime<Utc>;

/// A single dynamically typed value carried by facts, labels and feature cells.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric cast used by numeric aggregations. Text is parsed leniently;
    /// anything that does not parse yields `None` and is skipped by callers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) if f.is_finite() => Some(*f),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }

    /// String cast used by categorical aggregations.
    pub fn as_category(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }

    /// Boolean projection used by the binary label policy. Integer and
    /// boolean text is read the same way as the truncation cast; other text
    /// counts when non-blank.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Text(s) => parse_label_text(s).map_or(!s.trim().is_empty(), |v| v != 0),
        }
    }
}

/// Reads label text as an integer: `"true"`/`"false"` in any case, or a
/// base-10 integer, surrounding whitespace ignored.
pub(crate) fn parse_label_text(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Some(1)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Some(0)
    } else {
        trimmed.parse::<i64>().ok()
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub value: Scalar,
    pub timestamp: Timestamp,
}

impl Fact {
    pub fn new(value: impl Into<Scalar>, timestamp: Timestamp) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

pub type FactMap = BTreeMap<String, Vec<Fact>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub entity_id: String,
    pub session_ts: Timestamp,
    pub session_id: String,
    #[serde(default)]
    pub facts: FactMap,
}

impl Session {
    pub fn new(
        entity_id: impl Into<String>,
        session_id: impl Into<String>,
        session_ts: Timestamp,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            session_ts,
            session_id: session_id.into(),
            facts: FactMap::new(),
        }
    }

    pub fn with_fact(
        mut self,
        name: impl Into<String>,
        value: impl Into<Scalar>,
        timestamp: Timestamp,
    ) -> Self {
        self.push_fact(name, Fact::new(value, timestamp));
        self
    }

    pub fn push_fact(&mut self, name: impl Into<String>, fact: Fact) {
        self.facts.entry(name.into()).or_default().push(fact);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub entity_id: String,
    pub conversion_ts: Timestamp,
    #[serde(default)]
    pub label: Scalar,
}

impl Conversion {
    pub fn new(
        entity_id: impl Into<String>,
        conversion_ts: Timestamp,
        label: impl Into<Scalar>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            conversion_ts,
            label: label.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("{record}: missing required field `{field}`")]
    MissingField { record: String, field: &'static str },
    #[error("{record}: invalid value for `{field}`: {reason}")]
    InvalidField {
        record: String,
        field: &'static str,
        reason: String,
    },
    #[error("fact row references unknown session `{session_id}`")]
    UnknownSession { session_id: String },
}

pub fn validate_session(session: &Session) -> Result<(), IngestError> {
    let record = format!("session `{}`", session.session_id);
    if session.session_id.trim().is_empty() {
        return Err(IngestError::MissingField {
            record: format!("session of entity `{}`", session.entity_id),
            field: "session_id",
        });
    }
    if session.entity_id.trim().is_empty() {
        return Err(IngestError::MissingField {
            record,
            field: "entity_id",
        });
    }
    if session.facts.keys().any(|name| name.trim().is_empty()) {
        return Err(IngestError::MissingField {
            record,
            field: "fact_name",
        });
    }
    Ok(())
}

pub fn validate_conversion(conversion: &Conversion) -> Result<(), IngestError> {
    if conversion.entity_id.trim().is_empty() {
        return Err(IngestError::MissingField {
            record: format!("conversion at {}", conversion.conversion_ts),
            field: "entity_id",
        });
    }
    Ok(())
}
