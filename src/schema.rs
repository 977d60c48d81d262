//! Feature table schema descriptor and compatibility fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fact::{Scalar, Timestamp};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Fixed leading columns of every feature row, in output order.
pub const METADATA_COLUMNS: [&str; 4] = [
    "window_start_ts",
    "window_end_ts",
    "snapshot_ts",
    "entity_id",
];
pub const LABEL_COLUMN: &str = "label";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDType {
    Float64,
    Int64,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub includes_label: bool,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn new(columns: Vec<FeatureColumn>, includes_label: bool) -> Self {
        let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, includes_label, &columns);
        Self {
            version: FEATURE_SCHEMA_VERSION,
            fingerprint,
            includes_label,
            columns,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Full output header: metadata, optional label, then feature columns.
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
        if self.includes_label {
            header.push(LABEL_COLUMN.to_string());
        }
        header.extend(self.columns.iter().map(|c| c.name.clone()));
        header
    }
}

/// One output record; `values` is aligned with [`FeatureSchema::columns`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub window_start_ts: Timestamp,
    pub window_end_ts: Timestamp,
    pub snapshot_ts: Timestamp,
    pub entity_id: String,
    pub label: Option<Scalar>,
    pub values: Vec<Scalar>,
}

impl FeatureRow {
    pub fn get<'a>(&'a self, schema: &FeatureSchema, name: &str) -> Option<&'a Scalar> {
        schema.column_index(name).and_then(|idx| self.values.get(idx))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(version: u32, includes_label: bool, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("label:{includes_label};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(match column.dtype {
            FeatureDType::Float64 => ":f64;",
            FeatureDType::Int64 => ":i64;",
            FeatureDType::Text => ":text;",
        });
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<FeatureColumn> {
        vec![
            FeatureColumn {
                name: "sum_revenue".to_string(),
                dtype: FeatureDType::Float64,
            },
            FeatureColumn {
                name: "count_channel".to_string(),
                dtype: FeatureDType::Int64,
            },
        ]
    }

    #[test]
    fn fingerprint_tracks_columns_and_label_flag() {
        let a = FeatureSchema::new(columns(), true);
        let b = FeatureSchema::new(columns(), true);
        let unlabeled = FeatureSchema::new(columns(), false);
        let mut reordered_columns = columns();
        reordered_columns.reverse();
        let reordered = FeatureSchema::new(reordered_columns, true);

        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
        assert_ne!(a.fingerprint, unlabeled.fingerprint);
        assert_ne!(a.fingerprint, reordered.fingerprint);
    }

    #[test]
    fn header_places_label_after_metadata() {
        let schema = FeatureSchema::new(columns(), true);
        assert_eq!(
            schema.header(),
            vec![
                "window_start_ts",
                "window_end_ts",
                "snapshot_ts",
                "entity_id",
                "label",
                "sum_revenue",
                "count_channel",
            ]
        );
        assert_eq!(FeatureSchema::new(columns(), false).header().len(), 6);
    }

    #[test]
    fn compatibility_check_matches_version_and_fingerprint() {
        let schema = FeatureSchema::new(columns(), true);
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &schema)
            .expect("compatibility should pass");

        let err = assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, &schema)
            .expect_err("version mismatch expected");
        assert!(matches!(err, SchemaError::VersionMismatch { .. }));

        let err = assert_schema_compatible(FEATURE_SCHEMA_VERSION, "not-real", &schema)
            .expect_err("fingerprint mismatch expected");
        assert!(matches!(err, SchemaError::FingerprintMismatch { .. }));
    }
}
