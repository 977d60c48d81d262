//! Global top-N categorical value ranking and column-name encoding.
//!
//! Encoded names follow `{fact}_{value}_{fingerprint}`:
//! - the value is sanitized to `[a-zA-Z0-9_]` and right-truncated so that
//!   `len(fact) + len(value) + len(fingerprint) <= 74`
//! - the fingerprint is the first 8 bytes of SHA-256 over the raw value,
//!   printed as an unsigned decimal
//! - a null value encodes as `{fact}_NULL`

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::fact::Session;

pub const COLUMN_NAME_BUDGET: usize = 74;
pub const MAX_FINGERPRINT_DIGITS: usize = 20;
pub const NULL_SUFFIX: &str = "NULL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("fact name `{fact_name}` must be non-empty and match [a-zA-Z0-9_]")]
    InvalidFactName { fact_name: String },
    #[error(
        "fact name `{fact_name}` ({fact_len} chars) plus a {fingerprint_len}-digit fingerprint exceeds the {budget}-char column budget; rename the fact"
    )]
    ColumnNameTooLong {
        fact_name: String,
        fact_len: usize,
        fingerprint_len: usize,
        budget: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalValueRank {
    pub fact_name: String,
    pub value: Option<String>,
    pub count: u64,
    pub rank: u32,
    pub column_suffix: String,
}

/// Read-only lookup of ranked values, keyed by fact name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRankTable {
    by_fact: BTreeMap<String, Vec<CategoricalValueRank>>,
}

impl ValueRankTable {
    pub fn from_ranks(ranks: impl IntoIterator<Item = CategoricalValueRank>) -> Self {
        let mut by_fact: BTreeMap<String, Vec<CategoricalValueRank>> = BTreeMap::new();
        for rank in ranks {
            by_fact.entry(rank.fact_name.clone()).or_default().push(rank);
        }
        for ranks in by_fact.values_mut() {
            ranks.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.value.cmp(&b.value)));
        }
        Self { by_fact }
    }

    pub fn values_for(&self, fact_name: &str) -> &[CategoricalValueRank] {
        self.by_fact
            .get(fact_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoricalValueRank> {
        self.by_fact.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_fact.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingRequest {
    pub facts: Vec<String>,
    pub top_n_per_fact: usize,
    /// Facts listed here rank exactly these values instead of the corpus top-N.
    #[serde(default)]
    pub explicit_values: BTreeMap<String, Vec<String>>,
}

impl RankingRequest {
    pub fn top_n(facts: impl IntoIterator<Item = impl Into<String>>, top_n_per_fact: usize) -> Self {
        Self {
            facts: facts.into_iter().map(Into::into).collect(),
            top_n_per_fact,
            explicit_values: BTreeMap::new(),
        }
    }
}

pub fn rank_values(
    sessions: &[Session],
    req: &RankingRequest,
) -> Result<ValueRankTable, EncodingError> {
    for fact_name in &req.facts {
        validate_fact_name(fact_name)?;
    }

    let ranks = req
        .facts
        .par_iter()
        .map(|fact_name| {
            let counts = count_values(sessions, fact_name);
            let selected = match req.explicit_values.get(fact_name) {
                Some(values) => select_explicit(&counts, values),
                None => select_top_n(counts, req.top_n_per_fact),
            };
            assign_ranks(fact_name, selected)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let table = ValueRankTable::from_ranks(ranks.into_iter().flatten());

    info!(
        component = "ranking",
        event = "ranking.finish",
        fact_count = req.facts.len(),
        top_n_per_fact = req.top_n_per_fact,
        ranked_values = table.len()
    );

    Ok(table)
}

fn count_values(sessions: &[Session], fact_name: &str) -> HashMap<Option<String>, u64> {
    let mut counts = HashMap::new();
    for facts in sessions.iter().filter_map(|s| s.facts.get(fact_name)) {
        for fact in facts {
            *counts.entry(fact.value.as_category()).or_insert(0) += 1;
        }
    }
    counts
}

fn select_top_n(counts: HashMap<Option<String>, u64>, top_n: usize) -> Vec<(Option<String>, u64)> {
    let mut ordered: Vec<(Option<String>, u64)> = counts.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ordered.truncate(top_n);
    ordered
}

fn select_explicit(
    counts: &HashMap<Option<String>, u64>,
    values: &[String],
) -> Vec<(Option<String>, u64)> {
    let mut seen = std::collections::HashSet::new();
    let mut ordered: Vec<(Option<String>, u64)> = values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .map(|v| {
            let key = Some(v.clone());
            let count = counts.get(&key).copied().unwrap_or(0);
            (key, count)
        })
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ordered
}

fn assign_ranks(
    fact_name: &str,
    ordered: Vec<(Option<String>, u64)>,
) -> Result<Vec<CategoricalValueRank>, EncodingError> {
    let mut ranks = Vec::with_capacity(ordered.len());
    let mut rank = 0_u32;
    let mut previous_count = None;
    for (value, count) in ordered {
        if previous_count != Some(count) {
            rank += 1;
            previous_count = Some(count);
        }
        let column_suffix = encode_column_name(fact_name, value.as_deref())?;
        ranks.push(CategoricalValueRank {
            fact_name: fact_name.to_string(),
            value,
            count,
            rank,
            column_suffix,
        });
    }
    Ok(ranks)
}

pub fn value_fingerprint(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

pub fn sanitize_identifier(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Rejects fact names that are not legal identifiers or that could not fit
/// even the longest possible fingerprint.
pub fn validate_fact_name(fact_name: &str) -> Result<(), EncodingError> {
    if fact_name.is_empty() || sanitize_identifier(fact_name) != fact_name {
        return Err(EncodingError::InvalidFactName {
            fact_name: fact_name.to_string(),
        });
    }
    check_budget(fact_name, MAX_FINGERPRINT_DIGITS)?;
    Ok(())
}

pub fn encode_column_name(fact_name: &str, value: Option<&str>) -> Result<String, EncodingError> {
    let Some(value) = value else {
        return Ok(format!("{fact_name}_{NULL_SUFFIX}"));
    };

    let fingerprint = value_fingerprint(value).to_string();
    let room = check_budget(fact_name, fingerprint.len())?;
    let truncated: String = sanitize_identifier(value).chars().take(room).collect();
    Ok(format!("{fact_name}_{truncated}_{fingerprint}"))
}

fn check_budget(fact_name: &str, fingerprint_len: usize) -> Result<usize, EncodingError> {
    let fixed = fact_name.len() + fingerprint_len;
    if fixed > COLUMN_NAME_BUDGET {
        return Err(EncodingError::ColumnNameTooLong {
            fact_name: fact_name.to_string(),
            fact_len: fact_name.len(),
            fingerprint_len,
            budget: COLUMN_NAME_BUDGET,
        });
    }
    Ok(COLUMN_NAME_BUDGET - fixed)
}
