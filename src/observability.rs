//! Logging setup for the dataset builder.
//!
//! Every stage logs under its own module target (`lookback::windowing`,
//! `lookback::store`, ...), so verbosity can be raised or lowered per stage
//! without touching the rest of the run.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::aggregate::parse_fact_list;

/// Stage modules that accept a verbosity override.
pub const PIPELINE_STAGES: &[&str] = &[
    "store",
    "explore",
    "windowing",
    "label",
    "truncate",
    "ranking",
    "aggregate",
    "pipeline",
    "export",
];

const LEVEL_VAR: &str = "LOOKBACK_LOG_LEVEL";
const FORMAT_VAR: &str = "LOOKBACK_LOG_FORMAT";
const STAGES_VAR: &str = "LOOKBACK_LOG_STAGES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Per-stage level overrides, keyed by an entry of [`PIPELINE_STAGES`].
    pub stage_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            stage_levels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("unknown log format `{0}` (expected json or pretty)")]
    UnknownFormat(String),
    #[error("unknown pipeline stage `{0}` in stage log levels")]
    UnknownStage(String),
    #[error("malformed stage log level `{0}` (expected stage=level)")]
    MalformedStageLevel(String),
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl LoggingConfig {
    /// Builds a config from `LOOKBACK_LOG_*` values supplied by `lookup`.
    /// Unset or blank values keep their defaults.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, LoggingInitError> {
        let mut config = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(level) = read(LEVEL_VAR) {
            config.level = level;
        }
        if let Some(format) = read(FORMAT_VAR) {
            config.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => return Err(LoggingInitError::UnknownFormat(format)),
            };
        }
        if let Some(stages) = read(STAGES_VAR) {
            for entry in parse_fact_list(&stages) {
                let (stage, level) = entry
                    .split_once('=')
                    .map(|(stage, level)| (stage.trim(), level.trim()))
                    .filter(|(stage, level)| !stage.is_empty() && !level.is_empty())
                    .ok_or_else(|| LoggingInitError::MalformedStageLevel(entry.clone()))?;
                config = config.with_stage_level(stage, level)?;
            }
        }

        Ok(config)
    }

    pub fn with_stage_level(
        mut self,
        stage: &str,
        level: impl Into<String>,
    ) -> Result<Self, LoggingInitError> {
        if !PIPELINE_STAGES.contains(&stage) {
            return Err(LoggingInitError::UnknownStage(stage.to_string()));
        }
        self.stage_levels.insert(stage.to_string(), level.into());
        Ok(self)
    }

    /// Filter directives: the base level first, then one override per stage.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        directives.extend(
            self.stage_levels
                .iter()
                .map(|(stage, level)| format!("{}::{stage}={level}", env!("CARGO_CRATE_NAME"))),
        );
        directives.join(",")
    }

    pub fn env_filter(&self) -> Result<EnvFilter, LoggingInitError> {
        Ok(EnvFilter::try_new(self.filter_directives())?)
    }
}

pub fn logging_config_from_env() -> Result<LoggingConfig, LoggingInitError> {
    LoggingConfig::from_lookup(|key| env::var(key).ok())
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_target(true)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "build_feature_table",
        event = "app.start",
        log_format = ?config.format,
        log_filter = %config.filter_directives()
    );
}

pub fn log_inputs_selected(config_path: &Path, store_path: &Path, output_dir: &Path) {
    info!(
        component = "build_feature_table",
        event = "inputs.selected",
        config_path = %config_path.display(),
        store_path = %store_path.display(),
        output_dir = %output_dir.display()
    );
}

pub fn log_output_written(artifact: &str, path: &Path, rows: Option<usize>) {
    match rows {
        Some(rows) => info!(
            component = "build_feature_table",
            event = "output.written",
            artifact,
            path = %path.display(),
            rows
        ),
        None => info!(
            component = "build_feature_table",
            event = "output.written",
            artifact,
            path = %path.display()
        ),
    }
}
