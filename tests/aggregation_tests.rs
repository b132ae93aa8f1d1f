use pretty_assertions::assert_eq;
use tenant_aggregator::aggregation::{IncrementOutcome, SessionOutcome, WindowView};
use tenant_aggregator::event::{SESSION_END, SESSION_START};
use tenant_aggregator::{Event, SessionStats, SessionTracker, WindowConfig, WindowKey, WindowedCounter};

fn counter(size: f64, step: f64, expiry: f64) -> WindowedCounter {
    WindowedCounter::new(WindowConfig::from_secs(size, step, expiry).unwrap())
}

#[test]
fn test_single_event_lands_in_every_covering_window() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");

    let outcome = counter.increment(&key, 100.0);

    assert_eq!(
        outcome,
        IncrementOutcome {
            updated: 3,
            behind_watermark: 0
        }
    );
    assert_eq!(
        counter.windows(&key),
        vec![
            WindowView { start: 60.0, end: 120.0, count: 1 },
            WindowView { start: 80.0, end: 140.0, count: 1 },
            WindowView { start: 100.0, end: 160.0, count: 1 },
        ]
    );
    assert_eq!(counter.current(&key, 100.0), 1);
}

#[test]
fn test_current_reads_latest_starting_window() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");

    counter.increment(&key, 65.0);
    counter.increment(&key, 85.0);
    counter.increment(&key, 101.0);

    // Window [100, 160) only holds the last event
    assert_eq!(counter.current(&key, 101.0), 1);
    // Window [80, 140) holds 85 and 101
    assert_eq!(counter.current(&key, 85.0), 2);
    // Window [60, 120) holds all three
    assert_eq!(counter.current(&key, 65.0), 3);
}

#[test]
fn test_window_boundaries_are_half_open() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");

    counter.increment(&key, 120.0);

    let starts: Vec<f64> = counter.windows(&key).iter().map(|w| w.start).collect();
    assert_eq!(starts, vec![80.0, 100.0, 120.0]);
}

#[test]
fn test_keys_are_independent() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let click = WindowKey::new("t1", "click");
    let view = WindowKey::new("t1", "view");
    let other_tenant = WindowKey::new("t2", "click");

    counter.increment(&click, 10.0);
    counter.increment(&click, 11.0);
    counter.increment(&view, 10.0);

    assert_eq!(counter.current(&click, 11.0), 2);
    assert_eq!(counter.current(&view, 10.0), 1);
    assert_eq!(counter.current(&other_tenant, 10.0), 0);
    assert_eq!(counter.key_count(), 2);
}

#[test]
fn test_window_survives_until_grace_period_ends() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");
    counter.increment(&key, 100.0);

    // [60,120) expires after 160, [80,140) after 180, [100,160) after 200
    assert_eq!(counter.sweep(160.0), 0);
    assert_eq!(counter.sweep(200.0), 2);
    assert_eq!(counter.current(&key, 100.0), 1);

    assert_eq!(counter.sweep(200.5), 1);
    assert_eq!(counter.current(&key, 100.0), 0);
    assert_eq!(counter.key_count(), 0);
}

#[test]
fn test_late_event_is_counted_until_next_sweep() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");

    counter.increment(&key, 100.0);
    counter.increment(&key, 1_000.0);
    assert_eq!(counter.sweep(1_000.0), 3);

    let outcome = counter.increment(&key, 100.0);
    assert!(outcome.is_late());
    assert_eq!(outcome.behind_watermark, 3);
    assert_eq!(counter.current(&key, 100.0), 1);
    assert_eq!(counter.window_count(), 6);

    assert_eq!(counter.sweep(1_000.0), 3);
    assert_eq!(counter.current(&key, 100.0), 0);
}

#[test]
fn test_out_of_order_event_within_grace_is_counted() {
    let mut counter = counter(60.0, 20.0, 40.0);
    let key = WindowKey::new("t1", "click");

    counter.increment(&key, 150.0);
    let outcome = counter.increment(&key, 95.0);

    // [40,100) ended at 100 and expires after 140, before the watermark of 150
    assert_eq!(outcome.updated, 3);
    assert_eq!(outcome.behind_watermark, 1);
    assert!(!outcome.is_late());
    assert_eq!(counter.current(&key, 95.0), 1);
    assert_eq!(counter.watermark(&key), Some(150.0));
}

#[test]
fn test_session_pairing_example() {
    let mut tracker = SessionTracker::new();

    tracker.on_event(&Event::new("a", SESSION_START, 10.0).with_session("s1"));
    let outcome = tracker.on_event(&Event::new("a", SESSION_END, 25.0).with_session("s1"));

    let expected = SessionStats {
        total_duration: 15.0,
        count: 1,
    };
    assert_eq!(
        outcome,
        SessionOutcome::Completed {
            duration: 15.0,
            stats: expected
        }
    );
    assert_eq!(tracker.stats("a"), Some(expected));
    assert_eq!(tracker.pending_count(), 0);
}

#[test]
fn test_unmatched_end_changes_nothing() {
    let mut tracker = SessionTracker::new();
    tracker.on_event(&Event::new("a", SESSION_START, 1.0).with_session("s1"));
    tracker.on_event(&Event::new("a", SESSION_END, 3.0).with_session("s1"));

    let outcome = tracker.on_event(&Event::new("a", SESSION_END, 5.0).with_session("s2"));

    assert_eq!(outcome, SessionOutcome::Unmatched);
    assert_eq!(
        tracker.stats("a"),
        Some(SessionStats {
            total_duration: 2.0,
            count: 1
        })
    );
}

#[test]
fn test_sessions_are_scoped_by_tenant() {
    let mut tracker = SessionTracker::new();
    tracker.on_event(&Event::new("a", SESSION_START, 10.0).with_session("shared"));

    let outcome = tracker.on_event(&Event::new("b", SESSION_END, 20.0).with_session("shared"));

    assert_eq!(outcome, SessionOutcome::Unmatched);
    assert_eq!(tracker.stats("b"), None);
    assert_eq!(tracker.pending_count(), 1);
}

#[test]
fn test_clock_anomaly_keeps_pending_start() {
    let mut tracker = SessionTracker::new();
    tracker.on_event(&Event::new("a", SESSION_START, 50.0).with_session("s1"));

    let outcome = tracker.on_event(&Event::new("a", SESSION_END, 40.0).with_session("s1"));
    assert_eq!(outcome, SessionOutcome::ClockAnomaly { duration: -10.0 });
    assert_eq!(tracker.stats("a"), None);

    let outcome = tracker.on_event(&Event::new("a", SESSION_END, 60.0).with_session("s1"));
    assert!(matches!(outcome, SessionOutcome::Completed { duration, .. } if duration == 10.0));
}

#[test]
fn test_restart_replaces_pending_start() {
    let mut tracker = SessionTracker::new();
    tracker.on_event(&Event::new("a", SESSION_START, 10.0).with_session("s1"));
    let outcome = tracker.on_event(&Event::new("a", SESSION_START, 12.0).with_session("s1"));
    assert_eq!(outcome, SessionOutcome::Started { replaced: Some(10.0) });

    tracker.on_event(&Event::new("a", SESSION_END, 20.0).with_session("s1"));
    assert_eq!(tracker.stats("a").and_then(|s| s.average_duration()), Some(8.0));
}
