//! Snapshot date enumeration and lookback/prediction window boundaries.
//!
//! Every boundary produced here is closed on both ends: a timestamp equal to
//! `start` or `end` belongs to the window. The same convention is used by the
//! sliding and the session-anchored windowing modes.

use chrono::{DateTime, Days, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fact::Timestamp;

/// Upper limit for every window size and gap, in days.
pub const MAX_WINDOW_DAYS: u32 = 36_600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid windowing config: {0}")]
    InvalidConfig(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("snapshot date {0} has no local midnight in the configured timezone")]
    InvalidSnapshotInstant(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl WindowBounds {
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, WindowError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| WindowError::UnknownTimezone(name.to_string()))
}

pub fn generate_snapshot_dates(
    start: NaiveDate,
    end: NaiveDate,
    slide_interval_days: u32,
) -> Result<Vec<NaiveDate>, WindowError> {
    if slide_interval_days == 0 {
        return Err(WindowError::InvalidConfig(
            "slide_interval_in_days must be >= 1".to_string(),
        ));
    }
    if end < start {
        return Err(WindowError::InvalidConfig(format!(
            "snapshot_end_date {end} precedes snapshot_start_date {start}"
        )));
    }

    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        match current.checked_add_days(Days::new(u64::from(slide_interval_days))) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(dates)
}

/// Local midnight of `date` in `tz`, expressed in UTC.
pub fn snapshot_instant(date: NaiveDate, tz: Tz) -> Result<Timestamp, WindowError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or(WindowError::InvalidSnapshotInstant(date))?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or(WindowError::InvalidSnapshotInstant(date))
}

/// Shifts `ts` by whole days, clamping to the representable range.
fn shift_days(ts: Timestamp, days: i64) -> Timestamp {
    let shifted = ChronoDuration::try_days(days).and_then(|delta| ts.checked_add_signed(delta));
    match shifted {
        Some(ts) => ts,
        None if days < 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

pub fn lookback_bounds(
    snapshot_ts: Timestamp,
    lookback_size_days: u32,
    lookback_gap_days: u32,
) -> WindowBounds {
    let end = shift_days(snapshot_ts, -i64::from(lookback_gap_days));
    WindowBounds {
        start: shift_days(end, -i64::from(lookback_size_days)),
        end,
    }
}

pub fn prediction_bounds(
    snapshot_ts: Timestamp,
    prediction_gap_days: u32,
    prediction_size_days: u32,
) -> WindowBounds {
    let start = shift_days(snapshot_ts, i64::from(prediction_gap_days));
    WindowBounds {
        start,
        end: shift_days(start, i64::from(prediction_size_days)),
    }
}
