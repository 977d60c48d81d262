//! Declarative feature specification, plan building and per-window execution.
//!
//! A [`FeatureSpec`] says which aggregations each fact gets. Together with the
//! global [`ValueRankTable`] it is lowered once into a [`FeaturePlan`]: an
//! ordered list of output columns, each reading from a shared per-fact input
//! (a numeric series or a categorical histogram). Executing the plan against a
//! window materializes each input at most once and then evaluates every column.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::Datelike;
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::info;

use crate::activity::ActivityIndex;
use crate::fact::{Fact, Scalar, Timestamp};
use crate::ranking::{validate_fact_name, EncodingError, RankingRequest, ValueRankTable};
use crate::schema::{FeatureColumn, FeatureDType, FeatureRow, FeatureSchema};
use crate::windowing::Window;

pub const DAYS_SINCE_FIRST_ACTIVITY: &str = "days_since_first_activity";
pub const DAYS_SINCE_LATEST_ACTIVITY: &str = "days_since_latest_activity";
pub const SNAPSHOT_DAY_OF_WEEK: &str = "snapshot_day_of_week";
pub const SNAPSHOT_WEEK_OF_YEAR: &str = "snapshot_week_of_year";
pub const SNAPSHOT_MONTH_OF_YEAR: &str = "snapshot_month_of_year";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericAggregation {
    Sum,
    Avg,
    AvgPerDay,
    Min,
    Max,
    Latest,
}

impl NumericAggregation {
    fn prefix(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::AvgPerDay => "avg_per_day",
            Self::Min => "min",
            Self::Max => "max",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalAggregation {
    Latest,
    Mode,
    Count,
    CountDistinct,
    /// `count_<encoded>` per ranked value plus `count_<fact>_others`.
    ValueCounts,
    /// `proportion_<encoded>` per ranked value plus `proportion_<fact>_others`.
    ValueProportions,
}

impl CategoricalAggregation {
    fn uses_ranked_values(self) -> bool {
        matches!(self, Self::ValueCounts | Self::ValueProportions)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalFeature {
    pub aggregations: BTreeSet<CategoricalAggregation>,
    /// Explicit value list replacing the corpus top-N for this fact. Accepts a
    /// JSON array or a comma-separated string.
    #[serde(
        default,
        deserialize_with = "deserialize_value_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueList {
    List(Vec<String>),
    Compact(String),
}

fn deserialize_value_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<ValueList>::deserialize(deserializer)?.map(|list| match list {
            ValueList::List(values) => values,
            ValueList::Compact(raw) => parse_fact_list(&raw),
        }),
    )
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    #[serde(default)]
    pub numeric: BTreeMap<String, BTreeSet<NumericAggregation>>,
    #[serde(default)]
    pub categorical: BTreeMap<String, CategoricalFeature>,
    #[serde(default = "default_true")]
    pub activity_features: bool,
    #[serde(default = "default_true")]
    pub seasonality_features: bool,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            numeric: BTreeMap::new(),
            categorical: BTreeMap::new(),
            activity_features: true,
            seasonality_features: true,
        }
    }
}

impl FeatureSpec {
    pub fn numeric(mut self, fact: impl Into<String>, aggs: &[NumericAggregation]) -> Self {
        self.numeric
            .entry(fact.into())
            .or_default()
            .extend(aggs.iter().copied());
        self
    }

    pub fn categorical(mut self, fact: impl Into<String>, aggs: &[CategoricalAggregation]) -> Self {
        self.categorical
            .entry(fact.into())
            .or_default()
            .aggregations
            .extend(aggs.iter().copied());
        self
    }

    pub fn categorical_values(mut self, fact: impl Into<String>, values: &[&str]) -> Self {
        self.categorical.entry(fact.into()).or_default().values =
            Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn without_metadata(mut self) -> Self {
        self.activity_features = false;
        self.seasonality_features = false;
        self
    }

    /// Ranking work needed by the value-level categorical aggregations.
    pub fn ranking_request(&self, top_n_per_fact: usize) -> RankingRequest {
        let mut req = RankingRequest {
            top_n_per_fact,
            ..RankingRequest::default()
        };
        for (fact, feature) in &self.categorical {
            if !feature.aggregations.iter().any(|a| a.uses_ranked_values()) {
                continue;
            }
            req.facts.push(fact.clone());
            if let Some(values) = &feature.values {
                req.explicit_values.insert(fact.clone(), values.clone());
            }
        }
        req
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        for (fact, aggs) in &self.numeric {
            validate_fact_name(fact)?;
            if aggs.is_empty() {
                return Err(PlanError::NoAggregations(fact.clone()));
            }
            if self.categorical.contains_key(fact) {
                return Err(PlanError::ConflictingFactKind(fact.clone()));
            }
        }
        for (fact, feature) in &self.categorical {
            validate_fact_name(fact)?;
            if feature.aggregations.is_empty() {
                return Err(PlanError::NoAggregations(fact.clone()));
            }
        }
        Ok(())
    }
}

/// Splits a comma-separated list of fact names or values, ignoring blanks.
pub fn parse_fact_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("fact `{0}` is requested as both numeric and categorical")]
    ConflictingFactKind(String),
    #[error("fact `{0}` has no aggregations requested")]
    NoAggregations(String),
    #[error("duplicate output column `{0}`")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
enum ColumnOp {
    Numeric(usize, NumericAggregation),
    CategoricalLatest(usize),
    CategoricalMode(usize),
    CategoricalCount(usize),
    CategoricalCountDistinct(usize),
    ValueCount(usize, Option<String>),
    OthersCount(usize),
    ValueProportion(usize, Option<String>),
    OthersProportion(usize),
    DaysSinceFirstActivity,
    DaysSinceLatestActivity,
    SnapshotDayOfWeek,
    SnapshotWeekOfYear,
    SnapshotMonthOfYear,
}

#[derive(Debug, Clone, PartialEq)]
struct CategoricalInput {
    fact: String,
    ranked: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct FeaturePlan {
    numeric_inputs: Vec<String>,
    categorical_inputs: Vec<CategoricalInput>,
    columns: Vec<FeatureColumn>,
    ops: Vec<ColumnOp>,
    tz: Tz,
}

impl FeaturePlan {
    pub fn build(spec: &FeatureSpec, ranks: &ValueRankTable, tz: Tz) -> Result<Self, PlanError> {
        spec.validate()?;

        let mut builder = PlanBuilder::default();

        for (fact, aggs) in &spec.numeric {
            let input = builder.numeric_inputs.len();
            builder.numeric_inputs.push(fact.clone());
            for agg in aggs {
                builder.push(
                    format!("{}_{fact}", agg.prefix()),
                    FeatureDType::Float64,
                    ColumnOp::Numeric(input, *agg),
                )?;
            }
        }

        for (fact, feature) in &spec.categorical {
            let input = builder.categorical_inputs.len();
            let ranked_values = ranks.values_for(fact);
            builder.categorical_inputs.push(CategoricalInput {
                fact: fact.clone(),
                ranked: ranked_values.iter().map(|r| r.value.clone()).collect(),
            });

            for agg in &feature.aggregations {
                match agg {
                    CategoricalAggregation::Latest => builder.push(
                        format!("latest_{fact}"),
                        FeatureDType::Text,
                        ColumnOp::CategoricalLatest(input),
                    )?,
                    CategoricalAggregation::Mode => builder.push(
                        format!("mode_{fact}"),
                        FeatureDType::Text,
                        ColumnOp::CategoricalMode(input),
                    )?,
                    CategoricalAggregation::Count => builder.push(
                        format!("count_{fact}"),
                        FeatureDType::Int64,
                        ColumnOp::CategoricalCount(input),
                    )?,
                    CategoricalAggregation::CountDistinct => builder.push(
                        format!("count_distinct_{fact}"),
                        FeatureDType::Int64,
                        ColumnOp::CategoricalCountDistinct(input),
                    )?,
                    CategoricalAggregation::ValueCounts => {
                        for rank in ranked_values {
                            builder.push(
                                format!("count_{}", rank.column_suffix),
                                FeatureDType::Int64,
                                ColumnOp::ValueCount(input, rank.value.clone()),
                            )?;
                        }
                        builder.push(
                            format!("count_{fact}_others"),
                            FeatureDType::Int64,
                            ColumnOp::OthersCount(input),
                        )?;
                    }
                    CategoricalAggregation::ValueProportions => {
                        for rank in ranked_values {
                            builder.push(
                                format!("proportion_{}", rank.column_suffix),
                                FeatureDType::Float64,
                                ColumnOp::ValueProportion(input, rank.value.clone()),
                            )?;
                        }
                        builder.push(
                            format!("proportion_{fact}_others"),
                            FeatureDType::Float64,
                            ColumnOp::OthersProportion(input),
                        )?;
                    }
                }
            }
        }

        if spec.activity_features {
            builder.push(
                DAYS_SINCE_FIRST_ACTIVITY.to_string(),
                FeatureDType::Int64,
                ColumnOp::DaysSinceFirstActivity,
            )?;
            builder.push(
                DAYS_SINCE_LATEST_ACTIVITY.to_string(),
                FeatureDType::Int64,
                ColumnOp::DaysSinceLatestActivity,
            )?;
        }
        if spec.seasonality_features {
            builder.push(
                SNAPSHOT_DAY_OF_WEEK.to_string(),
                FeatureDType::Text,
                ColumnOp::SnapshotDayOfWeek,
            )?;
            builder.push(
                SNAPSHOT_WEEK_OF_YEAR.to_string(),
                FeatureDType::Text,
                ColumnOp::SnapshotWeekOfYear,
            )?;
            builder.push(
                SNAPSHOT_MONTH_OF_YEAR.to_string(),
                FeatureDType::Text,
                ColumnOp::SnapshotMonthOfYear,
            )?;
        }

        info!(
            component = "aggregate",
            event = "plan.built",
            numeric_facts = builder.numeric_inputs.len(),
            categorical_facts = builder.categorical_inputs.len(),
            column_count = builder.columns.len(),
            timezone = %tz
        );

        Ok(Self {
            numeric_inputs: builder.numeric_inputs,
            categorical_inputs: builder.categorical_inputs,
            columns: builder.columns,
            ops: builder.ops,
            tz,
        })
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn schema(&self, prediction_mode: bool) -> FeatureSchema {
        FeatureSchema::new(self.columns.clone(), !prediction_mode)
    }
}

#[derive(Default)]
struct PlanBuilder {
    numeric_inputs: Vec<String>,
    categorical_inputs: Vec<CategoricalInput>,
    columns: Vec<FeatureColumn>,
    ops: Vec<ColumnOp>,
    seen: HashSet<String>,
}

impl PlanBuilder {
    fn push(&mut self, name: String, dtype: FeatureDType, op: ColumnOp) -> Result<(), PlanError> {
        if !self.seen.insert(name.clone()) {
            return Err(PlanError::DuplicateColumn(name));
        }
        self.columns.push(FeatureColumn { name, dtype });
        self.ops.push(op);
        Ok(())
    }
}

struct NumericSeries {
    points: Vec<(Timestamp, f64)>,
}

impl NumericSeries {
    fn from_facts(facts: &[Fact]) -> Self {
        Self {
            points: facts
                .iter()
                .filter_map(|f| f.value.as_f64().map(|v| (f.timestamp, v)))
                .collect(),
        }
    }

    fn sum(&self) -> f64 {
        self.points.iter().fold(0.0, |acc, (_, v)| acc + v)
    }

    fn evaluate(&self, agg: NumericAggregation) -> Scalar {
        match agg {
            NumericAggregation::Sum => Scalar::Float(self.sum()),
            NumericAggregation::Avg => {
                if self.points.is_empty() {
                    Scalar::Float(0.0)
                } else {
                    Scalar::Float(self.sum() / self.points.len() as f64)
                }
            }
            NumericAggregation::AvgPerDay => {
                let first = self.points.iter().map(|(ts, _)| *ts).min();
                let last = self.points.iter().map(|(ts, _)| *ts).max();
                let days = match (first, last) {
                    (Some(first), Some(last)) => (last - first).num_days().max(1),
                    _ => 1,
                };
                Scalar::Float(self.sum() / days as f64)
            }
            NumericAggregation::Min => self
                .points
                .iter()
                .map(|(_, v)| *v)
                .reduce(f64::min)
                .map_or(Scalar::Null, Scalar::Float),
            NumericAggregation::Max => self
                .points
                .iter()
                .map(|(_, v)| *v)
                .reduce(f64::max)
                .map_or(Scalar::Null, Scalar::Float),
            NumericAggregation::Latest => latest_by_time(&self.points)
                .map_or(Scalar::Null, |v| Scalar::Float(*v)),
        }
    }
}

struct CategoricalSeries {
    values: Vec<(Timestamp, Option<String>)>,
    histogram: HashMap<Option<String>, u64>,
    ranked_total: u64,
}

impl CategoricalSeries {
    fn from_facts(facts: &[Fact], ranked: &[Option<String>]) -> Self {
        let values: Vec<(Timestamp, Option<String>)> = facts
            .iter()
            .map(|f| (f.timestamp, f.value.as_category()))
            .collect();
        let mut histogram = HashMap::new();
        for (_, value) in &values {
            *histogram.entry(value.clone()).or_insert(0_u64) += 1;
        }
        let ranked_total = ranked
            .iter()
            .map(|value| histogram.get(value).copied().unwrap_or(0))
            .sum();
        Self {
            values,
            histogram,
            ranked_total,
        }
    }

    fn total(&self) -> u64 {
        self.values.len() as u64
    }

    fn count_of(&self, value: &Option<String>) -> u64 {
        self.histogram.get(value).copied().unwrap_or(0)
    }

    fn others(&self) -> u64 {
        self.total() - self.ranked_total
    }

    fn latest(&self) -> Scalar {
        latest_by_time(&self.values)
            .cloned()
            .flatten()
            .map_or(Scalar::Null, Scalar::Text)
    }

    fn mode(&self) -> Scalar {
        self.histogram
            .iter()
            .filter_map(|(value, count)| value.as_ref().map(|v| (v, *count)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map_or(Scalar::Null, |(value, _)| Scalar::Text(value.clone()))
    }

    fn count_distinct(&self) -> u64 {
        self.histogram.keys().filter(|value| value.is_some()).count() as u64
    }

    fn proportion(&self, count: u64) -> Scalar {
        safe_divide(count, self.total())
    }
}

/// Value at the greatest timestamp; on equal timestamps the later entry wins.
fn latest_by_time<T>(points: &[(Timestamp, T)]) -> Option<&T> {
    let mut latest: Option<&(Timestamp, T)> = None;
    for point in points {
        if latest.map_or(true, |current| point.0 >= current.0) {
            latest = Some(point);
        }
    }
    latest.map(|(_, value)| value)
}

fn safe_divide(numerator: u64, denominator: u64) -> Scalar {
    if denominator == 0 {
        Scalar::Null
    } else {
        Scalar::Float(numerator as f64 / denominator as f64)
    }
}

fn count_scalar(count: u64) -> Scalar {
    Scalar::Int(i64::try_from(count).unwrap_or(i64::MAX))
}

/// Computes one feature row for `window`. With `prediction_mode` set the label
/// is left out, matching a schema built with the same flag.
pub fn aggregate(
    window: &Window,
    plan: &FeaturePlan,
    activity: &ActivityIndex,
    prediction_mode: bool,
) -> FeatureRow {
    let empty: Vec<Fact> = Vec::new();
    let facts_for = |name: &str| window.facts.get(name).unwrap_or(&empty);

    let numeric: Vec<NumericSeries> = plan
        .numeric_inputs
        .iter()
        .map(|fact| NumericSeries::from_facts(facts_for(fact.as_str())))
        .collect();
    let categorical: Vec<CategoricalSeries> = plan
        .categorical_inputs
        .iter()
        .map(|input| CategoricalSeries::from_facts(facts_for(input.fact.as_str()), &input.ranked))
        .collect();

    let span = activity.span_before(&window.entity_id, window.snapshot_ts);
    let local_snapshot = window.snapshot_ts.with_timezone(&plan.tz);

    let values = plan
        .ops
        .iter()
        .map(|op| match op {
            ColumnOp::Numeric(input, agg) => numeric[*input].evaluate(*agg),
            ColumnOp::CategoricalLatest(input) => categorical[*input].latest(),
            ColumnOp::CategoricalMode(input) => categorical[*input].mode(),
            ColumnOp::CategoricalCount(input) => count_scalar(categorical[*input].total()),
            ColumnOp::CategoricalCountDistinct(input) => {
                count_scalar(categorical[*input].count_distinct())
            }
            ColumnOp::ValueCount(input, value) => count_scalar(categorical[*input].count_of(value)),
            ColumnOp::OthersCount(input) => count_scalar(categorical[*input].others()),
            ColumnOp::ValueProportion(input, value) => {
                let series = &categorical[*input];
                series.proportion(series.count_of(value))
            }
            ColumnOp::OthersProportion(input) => {
                let series = &categorical[*input];
                series.proportion(series.others())
            }
            ColumnOp::DaysSinceFirstActivity => span.map_or(Scalar::Null, |s| {
                Scalar::Int((window.snapshot_ts - s.first).num_days())
            }),
            ColumnOp::DaysSinceLatestActivity => span.map_or(Scalar::Null, |s| {
                Scalar::Int((window.snapshot_ts - s.latest).num_days())
            }),
            ColumnOp::SnapshotDayOfWeek => Scalar::Text(local_snapshot.format("%A").to_string()),
            ColumnOp::SnapshotWeekOfYear => {
                Scalar::Text(format!("{:02}", local_snapshot.iso_week().week()))
            }
            ColumnOp::SnapshotMonthOfYear => Scalar::Text(local_snapshot.format("%B").to_string()),
        })
        .collect();

    FeatureRow {
        window_start_ts: window.window_start_ts,
        window_end_ts: window.window_end_ts,
        snapshot_ts: window.snapshot_ts,
        entity_id: window.entity_id.clone(),
        label: if prediction_mode {
            None
        } else {
            Some(window.label.clone().unwrap_or_default())
        },
        values,
    }
}
