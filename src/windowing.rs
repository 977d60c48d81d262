//! Sliding and session-anchored lookback window generation.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use chrono_tz::Tz;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fact::{FactMap, Scalar, Session, Timestamp};
use crate::snapshot::{
    generate_snapshot_dates, lookback_bounds, parse_timezone, snapshot_instant, WindowBounds,
    WindowError, MAX_WINDOW_DAYS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub entity_id: String,
    pub snapshot_ts: Timestamp,
    pub window_start_ts: Timestamp,
    pub window_end_ts: Timestamp,
    pub facts: FactMap,
    pub label: Option<Scalar>,
}

impl Window {
    pub fn bounds(&self) -> WindowBounds {
        WindowBounds {
            start: self.window_start_ts,
            end: self.window_end_ts,
        }
    }

    pub fn fact_count(&self) -> usize {
        self.facts.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowingMode {
    Sliding,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub snapshot_start_date: NaiveDate,
    pub snapshot_end_date: NaiveDate,
    pub slide_interval_in_days: u32,
    pub lookback_window_size_in_days: u32,
    pub lookback_window_gap_in_days: u32,
    pub timezone: String,
}

impl WindowConfig {
    pub fn new(snapshot_start_date: NaiveDate, snapshot_end_date: NaiveDate) -> Self {
        Self {
            snapshot_start_date,
            snapshot_end_date,
            slide_interval_in_days: 7,
            lookback_window_size_in_days: 30,
            lookback_window_gap_in_days: 0,
            timezone: "UTC".to_string(),
        }
    }

    pub fn validate(&self) -> Result<Tz, WindowError> {
        if self.slide_interval_in_days == 0 {
            return Err(WindowError::InvalidConfig(
                "slide_interval_in_days must be >= 1".to_string(),
            ));
        }
        if self.lookback_window_size_in_days == 0 {
            return Err(WindowError::InvalidConfig(
                "lookback_window_size_in_days must be >= 1".to_string(),
            ));
        }
        for (field, days) in [
            ("lookback_window_size_in_days", self.lookback_window_size_in_days),
            ("lookback_window_gap_in_days", self.lookback_window_gap_in_days),
        ] {
            if days > MAX_WINDOW_DAYS {
                return Err(WindowError::InvalidConfig(format!(
                    "{field} must be <= {MAX_WINDOW_DAYS}, got {days}"
                )));
            }
        }
        if self.snapshot_end_date < self.snapshot_start_date {
            return Err(WindowError::InvalidConfig(format!(
                "snapshot_end_date {} precedes snapshot_start_date {}",
                self.snapshot_end_date, self.snapshot_start_date
            )));
        }
        parse_timezone(&self.timezone)
    }

    fn lookback(&self, snapshot_ts: Timestamp) -> WindowBounds {
        lookback_bounds(
            snapshot_ts,
            self.lookback_window_size_in_days,
            self.lookback_window_gap_in_days,
        )
    }
}

pub fn generate_windows(
    sessions: &[Session],
    cfg: &WindowConfig,
) -> Result<Vec<Window>, WindowError> {
    let tz = cfg.validate()?;
    let snapshots = generate_snapshot_dates(
        cfg.snapshot_start_date,
        cfg.snapshot_end_date,
        cfg.slide_interval_in_days,
    )?
    .into_iter()
    .map(|date| snapshot_instant(date, tz))
    .collect::<Result<Vec<_>, _>>()?;

    let by_entity = group_by_entity(sessions);
    let entity_count = by_entity.len();

    let windows: Vec<Window> = by_entity
        .into_par_iter()
        .flat_map_iter(|(entity_id, entity_sessions)| {
            sliding_windows_for_entity(entity_id, &entity_sessions, &snapshots, cfg)
        })
        .collect();

    info!(
        component = "windowing",
        event = "windowing.sliding.finish",
        entity_count,
        snapshot_count = snapshots.len(),
        window_count = windows.len(),
        empty_window_count = windows.iter().filter(|w| w.facts.is_empty()).count(),
        timezone = %tz
    );

    Ok(windows)
}

/// One window per session whose timestamp falls within the snapshot date range,
/// anchored at the session timestamp instead of a generated snapshot.
pub fn generate_session_windows(
    sessions: &[Session],
    cfg: &WindowConfig,
) -> Result<Vec<Window>, WindowError> {
    let tz = cfg.validate()?;
    let range_start = snapshot_instant(cfg.snapshot_start_date, tz)?;
    let after_end = cfg
        .snapshot_end_date
        .checked_add_days(Days::new(1))
        .ok_or(WindowError::InvalidSnapshotInstant(cfg.snapshot_end_date))?;
    let range_end_exclusive = snapshot_instant(after_end, tz)?;

    let by_entity = group_by_entity(sessions);
    let entity_count = by_entity.len();

    let windows: Vec<Window> = by_entity
        .into_par_iter()
        .flat_map_iter(|(entity_id, entity_sessions)| {
            entity_sessions
                .iter()
                .filter(|s| s.session_ts >= range_start && s.session_ts < range_end_exclusive)
                .map(|anchor| {
                    let bounds = cfg.lookback(anchor.session_ts);
                    Window {
                        entity_id: entity_id.to_string(),
                        snapshot_ts: anchor.session_ts,
                        window_start_ts: bounds.start,
                        window_end_ts: bounds.end,
                        facts: collect_facts(&entity_sessions, bounds),
                        label: None,
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect();

    info!(
        component = "windowing",
        event = "windowing.session.finish",
        entity_count,
        window_count = windows.len(),
        timezone = %tz
    );

    Ok(windows)
}

fn sliding_windows_for_entity(
    entity_id: &str,
    sessions: &[&Session],
    snapshots: &[Timestamp],
    cfg: &WindowConfig,
) -> Vec<Window> {
    let Some(first_seen) = sessions.first().map(|s| s.session_ts) else {
        return Vec::new();
    };

    snapshots
        .iter()
        .filter_map(|snapshot_ts| {
            let bounds = cfg.lookback(*snapshot_ts);
            if first_seen > bounds.end {
                return None;
            }
            Some(Window {
                entity_id: entity_id.to_string(),
                snapshot_ts: *snapshot_ts,
                window_start_ts: bounds.start,
                window_end_ts: bounds.end,
                facts: collect_facts(sessions, bounds),
                label: None,
            })
        })
        .collect()
}

fn group_by_entity(sessions: &[Session]) -> BTreeMap<&str, Vec<&Session>> {
    let mut grouped: BTreeMap<&str, Vec<&Session>> = BTreeMap::new();
    for session in sessions {
        grouped
            .entry(session.entity_id.as_str())
            .or_default()
            .push(session);
    }
    for group in grouped.values_mut() {
        group.sort_by(|a, b| {
            a.session_ts
                .cmp(&b.session_ts)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
    }
    grouped
}

fn collect_facts(sessions: &[&Session], bounds: WindowBounds) -> FactMap {
    let mut facts = FactMap::new();
    for session in sessions {
        for (name, values) in &session.facts {
            let mut inside = values
                .iter()
                .filter(|fact| bounds.contains(fact.timestamp))
                .cloned()
                .peekable();
            if inside.peek().is_some() {
                facts.entry(name.clone()).or_default().extend(inside);
            }
        }
    }
    // Stable sort: equal timestamps keep session order, so "latest" stays exact.
    for values in facts.values_mut() {
        values.sort_by_key(|fact| fact.timestamp);
    }
    facts
}
