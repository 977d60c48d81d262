use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use lookback::{
    init_logging, log_app_start, log_inputs_selected, log_output_written, logging_config_from_env,
    run_pipeline, write_feature_csv, write_schema_json, CancellationToken, CorpusStore,
    PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let config_path = std::env::var("LOOKBACK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lookback.json"));
    let store_path = std::env::var("LOOKBACK_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/corpus.sqlite"));
    let output_dir = std::env::var("LOOKBACK_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/out"));
    log_inputs_selected(&config_path, &store_path, &output_dir);

    let cfg = PipelineConfig::from_json_file(&config_path)?;
    cfg.validate()?;

    let corpus = CorpusStore::open(&store_path)?.load_corpus()?;
    let output = run_pipeline(
        &corpus.sessions,
        &corpus.conversions,
        &cfg,
        &CancellationToken::new(),
    )?;

    fs::create_dir_all(&output_dir)?;

    let features_path = output_dir.join("features.csv");
    write_feature_csv(BufWriter::new(File::create(&features_path)?), &output.table)?;
    log_output_written("features", &features_path, Some(output.table.len()));

    let schema_path = output_dir.join("schema.json");
    write_schema_json(BufWriter::new(File::create(&schema_path)?), &output.table.schema)?;
    log_output_written("schema", &schema_path, None);

    println!(
        "wrote {} rows x {} feature columns to {} (schema {})",
        output.table.len(),
        output.table.schema.columns.len(),
        features_path.display(),
        output.table.schema.fingerprint
    );

    Ok(())
}
