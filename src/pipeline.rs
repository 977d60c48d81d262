//! End-to-end dataset build: windows, labels, ranking, then per-window features.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use chrono_tz::Tz;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::activity::ActivityIndex;
use crate::aggregate::{aggregate, FeaturePlan, FeatureSpec, PlanError};
use crate::explore::{explore_facts, FactStatistics};
use crate::export::FeatureTable;
use crate::fact::{validate_conversion, validate_session, Conversion, IngestError, Session};
use crate::label::{attach_labels, LabelPolicy, LabelPolicyConfig, PredictionWindowConfig};
use crate::ranking::{rank_values, EncodingError, ValueRankTable};
use crate::schema::FeatureRow;
use crate::snapshot::{WindowError, MAX_WINDOW_DAYS};
use crate::truncate::{truncate_after_first_positive, TruncationError};
use crate::windowing::{generate_session_windows, generate_windows, WindowConfig, WindowingMode};

fn default_slide_interval() -> u32 {
    7
}

fn default_lookback_size() -> u32 {
    30
}

fn default_prediction_size() -> u32 {
    30
}

fn default_top_n() -> usize {
    10
}

fn default_windowing_mode() -> WindowingMode {
    WindowingMode::Sliding
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub snapshot_start_date: NaiveDate,
    pub snapshot_end_date: NaiveDate,
    #[serde(default = "default_slide_interval")]
    pub slide_interval_in_days: u32,
    #[serde(default = "default_lookback_size")]
    pub lookback_window_size_in_days: u32,
    #[serde(default)]
    pub lookback_window_gap_in_days: u32,
    #[serde(default)]
    pub prediction_window_gap_in_days: u32,
    #[serde(default = "default_prediction_size")]
    pub prediction_window_size_in_days: u32,
    #[serde(default)]
    pub stop_on_first_positive: bool,
    #[serde(default = "default_top_n")]
    pub top_n_values_per_fact: usize,
    #[serde(default = "default_windowing_mode")]
    pub windowing_mode: WindowingMode,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub prediction_mode: bool,
    #[serde(default)]
    pub label_policy: LabelPolicyConfig,
    #[serde(default)]
    pub features: FeatureSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid window configuration: {0}")]
    Window(#[from] WindowError),
    #[error("invalid feature specification: {0}")]
    Features(#[from] PlanError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn new(snapshot_start_date: NaiveDate, snapshot_end_date: NaiveDate) -> Self {
        Self {
            snapshot_start_date,
            snapshot_end_date,
            slide_interval_in_days: default_slide_interval(),
            lookback_window_size_in_days: default_lookback_size(),
            lookback_window_gap_in_days: 0,
            prediction_window_gap_in_days: 0,
            prediction_window_size_in_days: default_prediction_size(),
            stop_on_first_positive: false,
            top_n_values_per_fact: default_top_n(),
            windowing_mode: default_windowing_mode(),
            timezone: default_timezone(),
            prediction_mode: false,
            label_policy: LabelPolicyConfig::default(),
            features: FeatureSpec::default(),
            threads: None,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            snapshot_start_date: self.snapshot_start_date,
            snapshot_end_date: self.snapshot_end_date,
            slide_interval_in_days: self.slide_interval_in_days,
            lookback_window_size_in_days: self.lookback_window_size_in_days,
            lookback_window_gap_in_days: self.lookback_window_gap_in_days,
            timezone: self.timezone.clone(),
        }
    }

    pub fn prediction_window(&self) -> PredictionWindowConfig {
        PredictionWindowConfig {
            prediction_window_gap_in_days: self.prediction_window_gap_in_days,
            prediction_window_size_in_days: self.prediction_window_size_in_days,
        }
    }

    /// Checks every stage's settings up front and returns the resolved timezone.
    pub fn validate(&self) -> Result<Tz, ConfigError> {
        let tz = self.window_config().validate()?;
        self.features.validate()?;

        for (field, days) in [
            ("prediction_window_gap_in_days", self.prediction_window_gap_in_days),
            ("prediction_window_size_in_days", self.prediction_window_size_in_days),
        ] {
            if days > MAX_WINDOW_DAYS {
                return Err(ConfigError::Window(WindowError::InvalidConfig(format!(
                    "{field} must be <= {MAX_WINDOW_DAYS}, got {days}"
                ))));
            }
        }
        if !self.prediction_mode && self.prediction_window_size_in_days == 0 {
            return Err(ConfigError::Invalid(
                "prediction_window_size_in_days must be >= 1".to_string(),
            ));
        }
        if self.prediction_mode && self.stop_on_first_positive {
            return Err(ConfigError::Invalid(
                "stop_on_first_positive needs labels and cannot be combined with prediction_mode"
                    .to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be >= 1".to_string()));
        }

        Ok(tz)
    }
}

/// Shared flag for aborting a run from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid input record: {0}")]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Truncation(#[from] TruncationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("pipeline run was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub table: FeatureTable,
    pub statistics: FactStatistics,
    pub ranks: ValueRankTable,
}

pub fn run_pipeline(
    sessions: &[Session],
    conversions: &[Conversion],
    cfg: &PipelineConfig,
    token: &CancellationToken,
) -> Result<PipelineOutput, PipelineError> {
    let tz = cfg.validate()?;

    match cfg.threads {
        // Local pool so concurrent runs can use different thread counts.
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?;
            pool.install(|| run_stages(sessions, conversions, cfg, tz, token))
        }
        None => run_stages(sessions, conversions, cfg, tz, token),
    }
}

fn run_stages(
    sessions: &[Session],
    conversions: &[Conversion],
    cfg: &PipelineConfig,
    tz: Tz,
    token: &CancellationToken,
) -> Result<PipelineOutput, PipelineError> {
    let started = Instant::now();
    info!(
        component = "pipeline",
        event = "pipeline.start",
        sessions = sessions.len(),
        conversions = conversions.len(),
        windowing_mode = ?cfg.windowing_mode,
        prediction_mode = cfg.prediction_mode,
        stop_on_first_positive = cfg.stop_on_first_positive,
        threads = rayon::current_num_threads()
    );

    sessions.iter().try_for_each(validate_session)?;
    conversions.iter().try_for_each(validate_conversion)?;
    token.check()?;
    let statistics = explore_facts(sessions, &cfg.features);

    let window_cfg = cfg.window_config();
    let mut windows = match cfg.windowing_mode {
        WindowingMode::Sliding => generate_windows(sessions, &window_cfg)?,
        WindowingMode::Session => generate_session_windows(sessions, &window_cfg)?,
    };
    token.check()?;

    if !cfg.prediction_mode {
        let policy: Box<dyn LabelPolicy> = cfg.label_policy.build();
        attach_labels(
            &mut windows,
            conversions,
            &cfg.prediction_window(),
            policy.as_ref(),
        );
        if cfg.stop_on_first_positive {
            windows = truncate_after_first_positive(windows)?;
        }
    }
    token.check()?;

    // Ranking sees the whole corpus before any row is aggregated.
    let ranks = rank_values(
        sessions,
        &cfg.features.ranking_request(cfg.top_n_values_per_fact),
    )?;
    let plan = FeaturePlan::build(&cfg.features, &ranks, tz)?;
    let activity = ActivityIndex::from_sessions(sessions);
    token.check()?;

    let mut rows = windows
        .par_iter()
        .map(|window| -> Result<FeatureRow, PipelineError> {
            token.check()?;
            Ok(aggregate(window, &plan, &activity, cfg.prediction_mode))
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;
    rows.sort_by(|a, b| {
        a.entity_id
            .cmp(&b.entity_id)
            .then_with(|| a.snapshot_ts.cmp(&b.snapshot_ts))
    });

    let table = FeatureTable {
        schema: plan.schema(cfg.prediction_mode),
        rows,
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        rows = table.rows.len(),
        columns = table.schema.columns.len(),
        schema_fingerprint = %table.schema.fingerprint,
        elapsed_ms = started.elapsed().as_millis() as u64
    );

    Ok(PipelineOutput {
        table,
        statistics,
        ranks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::aggregate::NumericAggregation;
    use crate::fact::Timestamp;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).expect("valid date")
    }

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2021, 1, day, 12, 0, 0)
            .single()
            .expect("valid UTC timestamp")
    }

    fn config() -> PipelineConfig {
        let mut cfg = PipelineConfig::new(date(10), date(24));
        cfg.prediction_window_size_in_days = 7;
        cfg.features = FeatureSpec::default()
            .without_metadata()
            .numeric("revenue", &[NumericAggregation::Sum]);
        cfg
    }

    #[test]
    fn config_defaults_fill_missing_json_fields() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"snapshot_start_date": "2021-01-01", "snapshot_end_date": "2021-01-15"}"#,
        )
        .unwrap();
        assert_eq!(cfg, PipelineConfig::new(date(1), date(15)));
        assert_eq!(cfg.validate().unwrap(), Tz::UTC);
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let mut cfg = config();
        cfg.prediction_mode = true;
        cfg.stop_on_first_positive = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = config();
        cfg.slide_interval_in_days = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Window(_))));

        let mut cfg = config();
        cfg.threads = Some(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rows_are_sorted_and_labeled() {
        let sessions = vec![
            Session::new("b", "s2", at(5)).with_fact("revenue", 3_i64, at(5)),
            Session::new("a", "s1", at(2)).with_fact("revenue", 5_i64, at(2)),
        ];
        let conversions = vec![Conversion::new("a", at(12), true)];

        let out = run_pipeline(&sessions, &conversions, &config(), &CancellationToken::new())
            .unwrap();
        let keys: Vec<(&str, Timestamp)> = out
            .table
            .rows
            .iter()
            .map(|r| (r.entity_id.as_str(), r.snapshot_ts))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(out.table.len(), 6);

        let first_a = &out.table.rows[0];
        assert_eq!(first_a.entity_id, "a");
        assert_eq!(first_a.label, Some(crate::fact::Scalar::Bool(true)));
        assert_eq!(
            first_a.get(&out.table.schema, "sum_revenue"),
            Some(&crate::fact::Scalar::Float(5.0))
        );
    }

    #[test]
    fn cancelled_token_aborts_run() {
        let token = CancellationToken::new();
        token.cancel();
        let err = run_pipeline(&[], &[], &config(), &token).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn dedicated_thread_pool_gives_same_rows() {
        let sessions = vec![Session::new("a", "s1", at(2)).with_fact("revenue", 5_i64, at(2))];
        let mut pooled = config();
        pooled.threads = Some(2);
        let token = CancellationToken::new();
        let a = run_pipeline(&sessions, &[], &config(), &token).unwrap();
        let b = run_pipeline(&sessions, &[], &pooled, &token).unwrap();
        assert_eq!(a.table, b.table);
    }
}
