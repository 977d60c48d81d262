use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, TimeZone, Utc};
use lookback::{
    create_corpus_schema, insert_session, log_app_start, log_inputs_selected,
    log_output_written, run_pipeline, write_feature_csv, CancellationToken, CategoricalAggregation,
    CorpusStore, FeatureSpec, LoggingConfig, NumericAggregation, PipelineConfig, Session,
    Timestamp,
};
use rusqlite::Connection;
use tracing::dispatcher::with_default;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Captures JSON output filtered the same way `init_logging` filters it.
fn capture_logs(cfg: &LoggingConfig, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_env_filter(cfg.env_filter().expect("filter should parse"))
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn ts(d: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2021, 1, d, 12, 0, 0)
        .single()
        .expect("valid UTC timestamp")
}

fn sessions() -> Vec<Session> {
    vec![
        Session::new("u1", "s1", ts(2))
            .with_fact("revenue", 3_i64, ts(2))
            .with_fact("channel", "Direct", ts(2)),
        Session::new("u2", "s2", ts(4)).with_fact("revenue", "oops", ts(4)),
    ]
}

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::new(
        NaiveDate::from_ymd_opt(2021, 1, 8).expect("valid date"),
        NaiveDate::from_ymd_opt(2021, 1, 15).expect("valid date"),
    );
    cfg.stop_on_first_positive = true;
    cfg.features = FeatureSpec::default()
        .numeric("revenue", &[NumericAggregation::Sum])
        .categorical("channel", &[CategoricalAggregation::ValueCounts]);
    cfg
}

#[test]
fn pipeline_emits_stage_events() {
    let logs = capture_logs(&LoggingConfig::default(), || {
        let output = run_pipeline(&sessions(), &[], &config(), &CancellationToken::new())
            .expect("pipeline should succeed");
        assert_eq!(output.table.len(), 4);
    });

    for event in [
        "pipeline.start",
        "explore.numeric",
        "explore.categorical",
        "windowing.sliding.finish",
        "labels.attach.finish",
        "truncate.finish",
        "ranking.finish",
        "plan.built",
        "pipeline.finish",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event} in {logs}"
        );
    }
    assert!(logs.contains("\"skipped\":1"));
    assert!(logs.contains("\"component\":\"pipeline\""));
}

#[test]
fn warn_level_filter_suppresses_info_events() {
    let cfg = LoggingConfig {
        level: "warn".to_string(),
        ..LoggingConfig::default()
    };
    let logs = capture_logs(&cfg, || {
        run_pipeline(&sessions(), &[], &config(), &CancellationToken::new())
            .expect("pipeline should succeed");
    });
    assert!(!logs.contains("pipeline.start"));
}

#[test]
fn stage_levels_open_up_single_stages() {
    let cfg = LoggingConfig::from_lookup(|key| match key {
        "LOOKBACK_LOG_LEVEL" => Some("warn".to_string()),
        "LOOKBACK_LOG_STAGES" => Some("windowing=info,truncate=info".to_string()),
        _ => None,
    })
    .expect("stage levels should parse");

    let logs = capture_logs(&cfg, || {
        run_pipeline(&sessions(), &[], &config(), &CancellationToken::new())
            .expect("pipeline should succeed");
    });

    assert!(logs.contains("\"event\":\"windowing.sliding.finish\""));
    assert!(logs.contains("\"event\":\"truncate.finish\""));
    assert!(logs.contains("\"target\":\"lookback::windowing\""));
    for silenced in ["pipeline.start", "ranking.finish", "plan.built", "explore.numeric"] {
        assert!(!logs.contains(silenced), "{silenced} should be filtered out");
    }
}

#[test]
fn store_and_export_emit_io_events() {
    let tmp = tempfile::NamedTempFile::new().expect("tempfile should be created");
    let conn = Connection::open(tmp.path()).expect("sqlite should open");
    create_corpus_schema(&conn).expect("schema should be created");
    for session in sessions() {
        insert_session(&conn, &session).expect("session insert");
    }

    let logs = capture_logs(&LoggingConfig::default(), || {
        let corpus = CorpusStore::open(tmp.path())
            .expect("store should open")
            .load_corpus()
            .expect("corpus should load");
        let output = run_pipeline(
            &corpus.sessions,
            &corpus.conversions,
            &config(),
            &CancellationToken::new(),
        )
        .expect("pipeline should succeed");
        write_feature_csv(Vec::new(), &output.table).expect("csv should be written");
    });

    assert!(logs.contains("\"event\":\"store.load.finish\""));
    assert!(logs.contains("\"event\":\"export.csv.written\""));
}

#[test]
fn binary_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(&LoggingConfig::default(), || {
        let cfg = LoggingConfig::default();
        log_app_start(&cfg);
        log_inputs_selected(
            Path::new("lookback.json"),
            Path::new("corpus.sqlite"),
            Path::new("out"),
        );
        log_output_written("features", Path::new("out/features.csv"), Some(4));
        log_output_written("schema", Path::new("out/schema.json"), None);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"inputs.selected\""));
    assert!(logs.contains("\"event\":\"output.written\""));
    assert!(logs.contains("\"rows\":4"));
}
