//! Stop-on-first-positive truncation of labeled windows.

use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::fact::{parse_label_text, Scalar, Timestamp};
use crate::windowing::Window;

#[derive(Debug, Error, PartialEq)]
pub enum TruncationError {
    #[error("label {label:?} of entity `{entity_id}` at {snapshot_ts} is not an integer")]
    NonNumericLabel {
        entity_id: String,
        snapshot_ts: Timestamp,
        label: Scalar,
    },
}

/// Integer cast applied to labels before the positivity check.
///
/// Floats round half away from zero, text must read as an integer or as
/// `true`/`false`, and a missing label is never positive. Other text is rejected.
pub fn label_as_signed_int(label: Option<&Scalar>) -> Result<Option<i64>, String> {
    match label {
        None | Some(Scalar::Null) => Ok(None),
        Some(Scalar::Bool(b)) => Ok(Some(i64::from(*b))),
        Some(Scalar::Int(i)) => Ok(Some(*i)),
        Some(Scalar::Float(f)) if f.is_finite() => Ok(Some(f.round() as i64)),
        Some(Scalar::Float(f)) => Err(format!("non-finite float {f}")),
        Some(Scalar::Text(s)) => parse_label_text(s)
            .map(Some)
            .ok_or_else(|| format!("unparseable text {s:?}")),
    }
}

pub fn truncate_after_first_positive(windows: Vec<Window>) -> Result<Vec<Window>, TruncationError> {
    let input_count = windows.len();
    let mut first_positive: HashMap<String, Timestamp> = HashMap::new();

    for window in &windows {
        let value = label_as_signed_int(window.label.as_ref()).map_err(|_| {
            TruncationError::NonNumericLabel {
                entity_id: window.entity_id.clone(),
                snapshot_ts: window.snapshot_ts,
                label: window.label.clone().unwrap_or_default(),
            }
        })?;
        if value.is_some_and(|v| v > 0) {
            first_positive
                .entry(window.entity_id.clone())
                .and_modify(|ts| *ts = (*ts).min(window.snapshot_ts))
                .or_insert(window.snapshot_ts);
        }
    }

    let kept: Vec<Window> = windows
        .into_iter()
        .filter(|window| {
            first_positive
                .get(&window.entity_id)
                .map_or(true, |cutoff| window.snapshot_ts <= *cutoff)
        })
        .collect();

    info!(
        component = "truncate",
        event = "truncate.finish",
        input_windows = input_count,
        kept_windows = kept.len(),
        entities_with_positive = first_positive.len()
    );

    Ok(kept)
}
