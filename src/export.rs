//! CSV and JSON sinks for a finished feature table.

use std::io::Write;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::fact::{Scalar, Timestamp};
use crate::schema::{FeatureRow, FeatureSchema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("json write failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("row {row} has {actual} feature values, schema has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

pub fn write_feature_csv<W: Write>(writer: W, table: &FeatureTable) -> Result<(), ExportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(table.schema.header())?;

    let expected = table.schema.columns.len();
    for (idx, row) in table.rows.iter().enumerate() {
        if row.values.len() != expected {
            return Err(ExportError::RowWidth {
                row: idx,
                expected,
                actual: row.values.len(),
            });
        }

        let mut record = Vec::with_capacity(expected + 5);
        record.push(format_ts(row.window_start_ts));
        record.push(format_ts(row.window_end_ts));
        record.push(format_ts(row.snapshot_ts));
        record.push(row.entity_id.clone());
        if table.schema.includes_label {
            record.push(row.label.as_ref().map(Scalar::to_string).unwrap_or_default());
        }
        record.extend(row.values.iter().map(Scalar::to_string));
        csv_writer.write_record(&record)?;
    }
    csv_writer.flush()?;

    info!(
        component = "export",
        event = "export.csv.written",
        rows = table.rows.len(),
        columns = expected,
        schema_fingerprint = %table.schema.fingerprint
    );
    Ok(())
}

pub fn write_schema_json<W: Write>(writer: W, schema: &FeatureSchema) -> Result<(), ExportError> {
    serde_json::to_writer_pretty(writer, schema)?;
    Ok(())
}

fn format_ts(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::schema::{FeatureColumn, FeatureDType};

    fn table(includes_label: bool) -> FeatureTable {
        let ts = Utc
            .with_ymd_and_hms(2021, 1, 31, 0, 0, 0)
            .single()
            .expect("valid UTC timestamp");
        let start = Utc
            .with_ymd_and_hms(2021, 1, 1, 0, 0, 0)
            .single()
            .expect("valid UTC timestamp");
        let schema = FeatureSchema::new(
            vec![
                FeatureColumn {
                    name: "sum_revenue".to_string(),
                    dtype: FeatureDType::Float64,
                },
                FeatureColumn {
                    name: "mode_channel".to_string(),
                    dtype: FeatureDType::Text,
                },
            ],
            includes_label,
        );
        FeatureTable {
            schema,
            rows: vec![FeatureRow {
                window_start_ts: start,
                window_end_ts: ts,
                snapshot_ts: ts,
                entity_id: "u1".to_string(),
                label: includes_label.then_some(Scalar::Bool(true)),
                values: vec![Scalar::Float(12.5), Scalar::Null],
            }],
        }
    }

    #[test]
    fn csv_has_header_rfc3339_timestamps_and_empty_nulls() {
        let mut out = Vec::new();
        write_feature_csv(&mut out, &table(true)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "window_start_ts,window_end_ts,snapshot_ts,entity_id,label,sum_revenue,mode_channel"
        );
        assert_eq!(
            lines[1],
            "2021-01-01T00:00:00Z,2021-01-31T00:00:00Z,2021-01-31T00:00:00Z,u1,true,12.5,"
        );
    }

    #[test]
    fn prediction_tables_omit_label_column() {
        let mut out = Vec::new();
        write_feature_csv(&mut out, &table(false)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.lines().next().unwrap().contains("label"));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let mut bad = table(true);
        bad.rows[0].values.pop();
        let err = write_feature_csv(Vec::new(), &bad).unwrap_err();
        assert!(matches!(
            err,
            ExportError::RowWidth {
                row: 0,
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn schema_json_round_trips() {
        let schema = table(true).schema;
        let mut out = Vec::new();
        write_schema_json(&mut out, &schema).unwrap();
        let parsed: FeatureSchema = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, schema);
    }
}
