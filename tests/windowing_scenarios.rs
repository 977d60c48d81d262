use chrono::{Duration, NaiveDate, TimeZone, Utc};
use lookback::{
    generate_session_windows, generate_snapshot_dates, generate_windows, lookback_bounds,
    Scalar, Session, Timestamp, WindowConfig, WindowError, MAX_WINDOW_DAYS,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn ts(y: i32, m: u32, d: u32, h: u32) -> Timestamp {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .single()
        .expect("valid UTC timestamp")
}

fn daily_sessions(entity: &str, days: u32) -> Vec<Session> {
    (1..=days)
        .map(|day| {
            let at = ts(2021, 1, day, 9);
            Session::new(entity, format!("{entity}-{day}"), at)
                .with_fact("pageviews", i64::from(day), at)
                .with_fact("channel", if day % 2 == 0 { "Paid" } else { "Direct" }, at)
        })
        .collect()
}

#[test]
fn weekly_snapshots_cover_both_endpoints() {
    let dates = generate_snapshot_dates(date(2021, 1, 1), date(2021, 1, 15), 7).unwrap();
    assert_eq!(
        dates,
        vec![date(2021, 1, 1), date(2021, 1, 8), date(2021, 1, 15)]
    );
}

#[test]
fn lookback_with_gap_is_closed_at_both_ends() {
    let bounds = lookback_bounds(ts(2021, 2, 1, 0), 30, 1);
    assert_eq!(bounds.start, ts(2021, 1, 1, 0));
    assert_eq!(bounds.end, ts(2021, 1, 31, 0));

    let on_start = Session::new("u1", "start", ts(2021, 1, 1, 0))
        .with_fact("x", 1_i64, ts(2021, 1, 1, 0));
    let on_end = Session::new("u1", "end", ts(2021, 1, 31, 0))
        .with_fact("x", 2_i64, ts(2021, 1, 31, 0));
    let before = Session::new("u1", "before", ts(2020, 12, 31, 23))
        .with_fact("x", 3_i64, ts(2020, 12, 31, 23));
    let in_gap = Session::new("u1", "gap", ts(2021, 1, 31, 1))
        .with_fact("x", 4_i64, ts(2021, 1, 31, 1));

    let mut cfg = WindowConfig::new(date(2021, 2, 1), date(2021, 2, 1));
    cfg.lookback_window_gap_in_days = 1;
    let windows = generate_windows(&[in_gap, on_end, before, on_start], &cfg).unwrap();

    assert_eq!(windows.len(), 1);
    let values: Vec<&Scalar> = windows[0].facts["x"].iter().map(|f| &f.value).collect();
    assert_eq!(values, vec![&Scalar::Int(1), &Scalar::Int(2)]);
}

#[test]
fn every_window_respects_bounds_and_contains_only_its_facts() {
    let mut sessions = daily_sessions("alice", 28);
    sessions.extend(daily_sessions("bob", 10));

    for (size, gap, slide) in [(1, 0, 1), (7, 0, 3), (7, 2, 7), (14, 5, 2), (30, 1, 10)] {
        let mut cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 31));
        cfg.lookback_window_size_in_days = size;
        cfg.lookback_window_gap_in_days = gap;
        cfg.slide_interval_in_days = slide;

        let windows = generate_windows(&sessions, &cfg).unwrap();
        assert!(!windows.is_empty());
        for window in &windows {
            assert!(window.window_start_ts <= window.window_end_ts);
            assert!(window.window_end_ts <= window.snapshot_ts);
            assert_eq!(
                window.snapshot_ts - window.window_start_ts,
                Duration::days(i64::from(size + gap))
            );
            for facts in window.facts.values() {
                for fact in facts {
                    assert!(window.bounds().contains(fact.timestamp));
                }
                assert!(facts.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            }
        }
    }
}

#[test]
fn entity_gets_windows_only_after_first_activity_and_keeps_empty_ones() {
    let late = Session::new("late", "l1", ts(2021, 1, 10, 12))
        .with_fact("pageviews", 1_i64, ts(2021, 1, 10, 12));
    let mut cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 3, 1));
    cfg.lookback_window_size_in_days = 7;

    let windows = generate_windows(&[late], &cfg).unwrap();
    let snapshots: Vec<Timestamp> = windows.iter().map(|w| w.snapshot_ts).collect();
    assert_eq!(snapshots.first(), Some(&ts(2021, 1, 15, 0)));
    assert_eq!(snapshots.last(), Some(&ts(2021, 2, 26, 0)));
    assert!(windows[0].fact_count() == 1);
    assert!(windows[1..].iter().all(|w| w.facts.is_empty()));
    assert!(windows.iter().all(|w| w.label.is_none()));
}

#[test]
fn windows_are_ordered_by_entity_then_snapshot() {
    let mut sessions = daily_sessions("zed", 5);
    sessions.extend(daily_sessions("amy", 5));
    let cfg = WindowConfig::new(date(2021, 1, 5), date(2021, 1, 26));

    let windows = generate_windows(&sessions, &cfg).unwrap();
    let keys: Vec<(String, Timestamp)> = windows
        .iter()
        .map(|w| (w.entity_id.clone(), w.snapshot_ts))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(keys[0].0, "amy");
}

#[test]
fn session_mode_anchors_on_each_session_in_range() {
    let sessions = daily_sessions("alice", 20);
    let mut cfg = WindowConfig::new(date(2021, 1, 10), date(2021, 1, 12));
    cfg.lookback_window_size_in_days = 2;

    let windows = generate_session_windows(&sessions, &cfg).unwrap();
    let anchors: Vec<Timestamp> = windows.iter().map(|w| w.snapshot_ts).collect();
    assert_eq!(
        anchors,
        vec![ts(2021, 1, 10, 9), ts(2021, 1, 11, 9), ts(2021, 1, 12, 9)]
    );

    let first = &windows[0];
    assert_eq!(first.window_end_ts, first.snapshot_ts);
    let pageviews: Vec<&Scalar> = first.facts["pageviews"].iter().map(|f| &f.value).collect();
    assert_eq!(
        pageviews,
        vec![&Scalar::Int(8), &Scalar::Int(9), &Scalar::Int(10)]
    );
}

#[test]
fn local_midnight_snapshots_follow_timezone() {
    let at = ts(2021, 1, 1, 3);
    let sessions = vec![Session::new("u1", "s1", at).with_fact("x", 1_i64, at)];
    let mut cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 1));
    cfg.timezone = "America/New_York".to_string();

    let windows = generate_windows(&sessions, &cfg).unwrap();
    assert_eq!(windows[0].snapshot_ts, ts(2021, 1, 1, 5));
    assert_eq!(windows[0].fact_count(), 1);
}

#[test]
fn invalid_configuration_is_rejected() {
    let sessions = daily_sessions("alice", 3);

    let mut cfg = WindowConfig::new(date(2021, 1, 10), date(2021, 1, 1));
    assert!(matches!(
        generate_windows(&sessions, &cfg),
        Err(WindowError::InvalidConfig(_))
    ));

    cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 10));
    cfg.lookback_window_size_in_days = 0;
    assert!(matches!(
        generate_windows(&sessions, &cfg),
        Err(WindowError::InvalidConfig(_))
    ));

    cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 10));
    cfg.timezone = "Mars/Olympus_Mons".to_string();
    assert!(matches!(
        generate_session_windows(&sessions, &cfg),
        Err(WindowError::UnknownTimezone(_))
    ));
}

#[test]
fn oversized_lookback_spans_are_rejected_before_windowing() {
    let sessions = daily_sessions("alice", 3);

    let mut cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 10));
    cfg.lookback_window_size_in_days = u32::MAX;
    assert!(matches!(cfg.validate(), Err(WindowError::InvalidConfig(_))));
    assert!(matches!(
        generate_windows(&sessions, &cfg),
        Err(WindowError::InvalidConfig(_))
    ));

    cfg = WindowConfig::new(date(2021, 1, 1), date(2021, 1, 10));
    cfg.lookback_window_gap_in_days = MAX_WINDOW_DAYS + 1;
    assert!(matches!(
        generate_session_windows(&sessions, &cfg),
        Err(WindowError::InvalidConfig(_))
    ));

    cfg.lookback_window_gap_in_days = MAX_WINDOW_DAYS;
    cfg.lookback_window_size_in_days = MAX_WINDOW_DAYS;
    let windows = generate_session_windows(&sessions, &cfg).unwrap();
    assert_eq!(windows.len(), 3);
    assert!(windows.iter().all(|w| w.fact_count() == 0));
}
