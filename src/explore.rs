//! Corpus-level fact statistics reported before windowing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::FeatureSpec;
use crate::fact::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericFactStats {
    pub fact_name: String,
    pub count: u64,
    pub skipped: u64,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalFactStats {
    pub fact_name: String,
    pub count: u64,
    pub distinct: u64,
    pub nulls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactStatistics {
    pub numeric: Vec<NumericFactStats>,
    pub categorical: Vec<CategoricalFactStats>,
}

pub fn explore_facts(sessions: &[Session], spec: &FeatureSpec) -> FactStatistics {
    let numeric: Vec<NumericFactStats> = spec
        .numeric
        .keys()
        .map(|name| numeric_stats(sessions, name))
        .collect();
    let categorical: Vec<CategoricalFactStats> = spec
        .categorical
        .keys()
        .map(|name| categorical_stats(sessions, name))
        .collect();

    for stats in &numeric {
        info!(
            component = "explore",
            event = "explore.numeric",
            fact = %stats.fact_name,
            count = stats.count,
            skipped = stats.skipped,
            mean = ?stats.mean,
            stddev = ?stats.stddev
        );
    }
    for stats in &categorical {
        info!(
            component = "explore",
            event = "explore.categorical",
            fact = %stats.fact_name,
            count = stats.count,
            distinct = stats.distinct,
            nulls = stats.nulls
        );
    }

    FactStatistics {
        numeric,
        categorical,
    }
}

fn numeric_stats(sessions: &[Session], fact_name: &str) -> NumericFactStats {
    let mut values = Vec::new();
    let mut skipped = 0_u64;
    for fact in sessions
        .iter()
        .filter_map(|s| s.facts.get(fact_name))
        .flatten()
    {
        match fact.value.as_f64() {
            Some(v) => values.push(v),
            None => skipped += 1,
        }
    }

    let count = values.len() as u64;
    let mean = (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
    let stddev = mean.map(|mean| {
        let variance = values
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / values.len() as f64;
        variance.sqrt()
    });

    NumericFactStats {
        fact_name: fact_name.to_string(),
        count,
        skipped,
        mean,
        stddev,
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
    }
}

fn categorical_stats(sessions: &[Session], fact_name: &str) -> CategoricalFactStats {
    let mut count = 0_u64;
    let mut nulls = 0_u64;
    let mut distinct = HashSet::new();
    for fact in sessions
        .iter()
        .filter_map(|s| s.facts.get(fact_name))
        .flatten()
    {
        count += 1;
        match fact.value.as_category() {
            Some(value) => {
                distinct.insert(value);
            }
            None => nulls += 1,
        }
    }

    CategoricalFactStats {
        fact_name: fact_name.to_string(),
        count,
        distinct: distinct.len() as u64,
        nulls,
    }
}
