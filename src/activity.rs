//! Per-entity session timeline used for out-of-window activity features.

use std::collections::HashMap;

use crate::fact::{Session, Timestamp};

#[derive(Debug, Clone, Default)]
pub struct ActivityIndex {
    timelines: HashMap<String, Vec<Timestamp>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySpan {
    pub first: Timestamp,
    pub latest: Timestamp,
}

impl ActivityIndex {
    pub fn from_sessions(sessions: &[Session]) -> Self {
        let mut timelines: HashMap<String, Vec<Timestamp>> = HashMap::new();
        for session in sessions {
            timelines
                .entry(session.entity_id.clone())
                .or_default()
                .push(session.session_ts);
        }
        for timeline in timelines.values_mut() {
            timeline.sort_unstable();
        }
        Self { timelines }
    }

    /// First and latest session strictly before `before`, if any.
    pub fn span_before(&self, entity_id: &str, before: Timestamp) -> Option<ActivitySpan> {
        let timeline = self.timelines.get(entity_id)?;
        let end = timeline.partition_point(|ts| *ts < before);
        if end == 0 {
            return None;
        }
        Some(ActivitySpan {
            first: timeline[0],
            latest: timeline[end - 1],
        })
    }

    pub fn entity_count(&self) -> usize {
        self.timelines.len()
    }
}
