//! Prediction-window label derivation with pluggable policies.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fact::{Conversion, Scalar};
use crate::snapshot::prediction_bounds;
use crate::windowing::Window;

/// Reduces the conversions of one prediction window into a single label.
///
/// Implementations receive conversions ordered by `conversion_ts` and must be
/// pure: the same input always produces the same label. An empty slice must
/// resolve to the policy's default rather than an error.
pub trait LabelPolicy: Send + Sync {
    fn derive(&self, conversions: &[Conversion]) -> Scalar;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryLabel;

impl LabelPolicy for BinaryLabel {
    fn derive(&self, conversions: &[Conversion]) -> Scalar {
        Scalar::Bool(conversions.iter().any(|c| c.label.truthy()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegressionSumLabel;

impl LabelPolicy for RegressionSumLabel {
    fn derive(&self, conversions: &[Conversion]) -> Scalar {
        Scalar::Float(
            conversions
                .iter()
                .filter_map(|c| c.label.as_f64())
                .fold(0.0, |acc, v| acc + v),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirstOnlyLabel {
    pub default: Scalar,
}

impl LabelPolicy for FirstOnlyLabel {
    fn derive(&self, conversions: &[Conversion]) -> Scalar {
        conversions
            .first()
            .map(|c| c.label.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Adapter for caller-supplied reducers.
pub struct CustomLabel<F>(pub F);

impl<F> LabelPolicy for CustomLabel<F>
where
    F: Fn(&[Conversion]) -> Scalar + Send + Sync,
{
    fn derive(&self, conversions: &[Conversion]) -> Scalar {
        (self.0)(conversions)
    }
}

/// Serializable selection of the built-in policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelPolicyConfig {
    Binary,
    RegressionSum,
    FirstOnly {
        #[serde(default)]
        default: Scalar,
    },
}

impl Default for LabelPolicyConfig {
    fn default() -> Self {
        Self::Binary
    }
}

impl LabelPolicyConfig {
    pub fn build(&self) -> Box<dyn LabelPolicy> {
        match self {
            Self::Binary => Box::new(BinaryLabel),
            Self::RegressionSum => Box::new(RegressionSumLabel),
            Self::FirstOnly { default } => Box::new(FirstOnlyLabel {
                default: default.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionWindowConfig {
    pub prediction_window_gap_in_days: u32,
    pub prediction_window_size_in_days: u32,
}

pub fn derive_label(conversions: &[Conversion], policy: &dyn LabelPolicy) -> Scalar {
    let mut ordered = conversions.to_vec();
    ordered.sort_by_key(|c| c.conversion_ts);
    policy.derive(&ordered)
}

/// Derives and stores the label of every window from the conversions that fall
/// inside its prediction window.
pub fn attach_labels(
    windows: &mut [Window],
    conversions: &[Conversion],
    cfg: &PredictionWindowConfig,
    policy: &dyn LabelPolicy,
) {
    let mut by_entity: HashMap<&str, Vec<&Conversion>> = HashMap::new();
    for conversion in conversions {
        by_entity
            .entry(conversion.entity_id.as_str())
            .or_default()
            .push(conversion);
    }
    for list in by_entity.values_mut() {
        list.sort_by_key(|c| c.conversion_ts);
    }

    windows.par_iter_mut().for_each(|window| {
        let bounds = prediction_bounds(
            window.snapshot_ts,
            cfg.prediction_window_gap_in_days,
            cfg.prediction_window_size_in_days,
        );
        let in_window: Vec<Conversion> = by_entity
            .get(window.entity_id.as_str())
            .map(|list| {
                list.iter()
                    .filter(|c| bounds.contains(c.conversion_ts))
                    .map(|c| (*c).clone())
                    .collect()
            })
            .unwrap_or_default();
        window.label = Some(policy.derive(&in_window));
    });

    info!(
        component = "labels",
        event = "labels.attach.finish",
        window_count = windows.len(),
        conversion_count = conversions.len(),
        prediction_gap_days = cfg.prediction_window_gap_in_days,
        prediction_size_days = cfg.prediction_window_size_in_days
    );
}
