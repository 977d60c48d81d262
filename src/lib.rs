//! Lookback core crate.
//!
//! Builds labeled feature tables from per-entity session histories:
//! - snapshot and lookback window generation (sliding or session-anchored)
//! - label derivation from prediction-window conversions
//! - stop-on-first-positive truncation
//! - corpus-wide categorical value ranking and column encoding
//! - plan-based per-window feature aggregation
//! - SQLite corpus loading and CSV/JSON export

mod activity;
mod aggregate;
mod explore;
mod export;
mod fact;
mod label;
mod observability;
mod pipeline;
mod ranking;
mod schema;
mod snapshot;
mod store;
mod truncate;
mod windowing;

pub use activity::{ActivityIndex, ActivitySpan};
pub use aggregate::{
    aggregate, parse_fact_list, CategoricalAggregation, CategoricalFeature, FeaturePlan,
    FeatureSpec, NumericAggregation, PlanError, DAYS_SINCE_FIRST_ACTIVITY,
    DAYS_SINCE_LATEST_ACTIVITY, SNAPSHOT_DAY_OF_WEEK, SNAPSHOT_MONTH_OF_YEAR,
    SNAPSHOT_WEEK_OF_YEAR,
};
pub use explore::{explore_facts, CategoricalFactStats, FactStatistics, NumericFactStats};
pub use export::{write_feature_csv, write_schema_json, ExportError, FeatureTable};
pub use fact::{
    validate_conversion, validate_session, Conversion, Fact, FactMap, IngestError, Scalar,
    Session, Timestamp,
};
pub use label::{
    attach_labels, derive_label, BinaryLabel, CustomLabel, FirstOnlyLabel, LabelPolicy,
    LabelPolicyConfig, PredictionWindowConfig, RegressionSumLabel,
};
pub use observability::{
    init_logging, log_app_start, log_inputs_selected, log_output_written,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError, PIPELINE_STAGES,
};
pub use pipeline::{
    run_pipeline, CancellationToken, ConfigError, PipelineConfig, PipelineError, PipelineOutput,
};
pub use ranking::{
    encode_column_name, rank_values, sanitize_identifier, validate_fact_name, value_fingerprint,
    CategoricalValueRank, EncodingError, RankingRequest, ValueRankTable, COLUMN_NAME_BUDGET,
    MAX_FINGERPRINT_DIGITS, NULL_SUFFIX,
};
pub use schema::{
    assert_schema_compatible, FeatureColumn, FeatureDType, FeatureRow, FeatureSchema,
    SchemaError, FEATURE_SCHEMA_VERSION, LABEL_COLUMN, METADATA_COLUMNS,
};
pub use snapshot::{
    generate_snapshot_dates, lookback_bounds, parse_timezone, prediction_bounds,
    snapshot_instant, WindowBounds, WindowError, MAX_WINDOW_DAYS,
};
pub use store::{
    create_corpus_schema, insert_conversion, insert_session, Corpus, CorpusStore, StoreError,
};
pub use truncate::{label_as_signed_int, truncate_after_first_positive, TruncationError};
pub use windowing::{
    generate_session_windows, generate_windows, Window, WindowConfig, WindowingMode,
};
