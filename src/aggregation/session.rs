use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{Event, EventKind};

/// Pairing key of a session: sessions are scoped by tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Tenant identifier
    pub tenant_id: String,
    /// Session identifier from the event payload
    pub session_id: String,
}

impl SessionKey {
    /// Create a key from its parts
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
        }
    }

    fn from_event(event: &Event) -> Option<Self> {
        event
            .session_id()
            .map(|session_id| Self::new(event.tenant_id.clone(), session_id))
    }
}

/// Accumulated duration statistics for one tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Sum of completed session durations, in seconds
    pub total_duration: f64,
    /// Number of completed sessions
    pub count: u64,
}

impl SessionStats {
    /// Mean session duration, if any session completed
    pub fn average_duration(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_duration / self.count as f64)
    }
}

/// What a single event did to the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// A start was recorded; `replaced` holds the discarded earlier start, if any
    Started {
        /// Previous pending start for the same key
        replaced: Option<f64>,
    },
    /// A session closed; carries its duration and the tenant's updated stats
    Completed {
        /// Duration of this session, in seconds
        duration: f64,
        /// Stats after the update
        stats: SessionStats,
    },
    /// An end arrived with no pending start
    Unmatched,
    /// An end arrived before its start; the pairing was rejected
    ClockAnomaly {
        /// Negative computed duration
        duration: f64,
    },
    /// Not a session event, or it carries no session identifier
    Ignored,
}

/// Matches session starts and ends and accumulates per-tenant duration stats
#[derive(Debug, Default)]
pub struct SessionTracker {
    pending: HashMap<SessionKey, f64>,
    stats: HashMap<String, SessionStats>,
}

impl SessionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event
    pub fn on_event(&mut self, event: &Event) -> SessionOutcome {
        let kind = event.kind();
        if kind == EventKind::Other {
            return SessionOutcome::Ignored;
        }
        let Some(key) = SessionKey::from_event(event) else {
            return SessionOutcome::Ignored;
        };

        match kind {
            EventKind::SessionStart => {
                let replaced = self.pending.insert(key, event.timestamp);
                if let Some(previous) = replaced {
                    debug!(
                        tenant = %event.tenant_id,
                        previous,
                        ts = event.timestamp,
                        "Session restarted before ending, discarding earlier start"
                    );
                }
                SessionOutcome::Started { replaced }
            }
            EventKind::SessionEnd => self.close(key, event.timestamp),
            EventKind::Other => SessionOutcome::Ignored,
        }
    }

    fn close(&mut self, key: SessionKey, end: f64) -> SessionOutcome {
        let Some(&start) = self.pending.get(&key) else {
            debug!(tenant = %key.tenant_id, session = %key.session_id, "Session end without start");
            return SessionOutcome::Unmatched;
        };

        let duration = end - start;
        if duration < 0.0 {
            warn!(
                tenant = %key.tenant_id,
                session = %key.session_id,
                start,
                end,
                "Session ended before it started, rejecting pairing"
            );
            return SessionOutcome::ClockAnomaly { duration };
        }

        self.pending.remove(&key);
        let stats = self.stats.entry(key.tenant_id).or_default();
        stats.total_duration += duration;
        stats.count += 1;

        SessionOutcome::Completed {
            duration,
            stats: *stats,
        }
    }

    /// Stats for a tenant, if any of its sessions completed
    pub fn stats(&self, tenant_id: &str) -> Option<SessionStats> {
        self.stats.get(tenant_id).copied()
    }

    /// Stats for every tenant
    pub fn all_stats(&self) -> impl Iterator<Item = (&str, &SessionStats)> {
        self.stats.iter().map(|(tenant, stats)| (tenant.as_str(), stats))
    }

    /// Pending start for a session, if one is open
    pub fn pending_start(&self, key: &SessionKey) -> Option<f64> {
        self.pending.get(key).copied()
    }

    /// Number of sessions waiting for their end event
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SESSION_END, SESSION_START};

    fn start(tenant: &str, session: &str, ts: f64) -> Event {
        Event::new(tenant, SESSION_START, ts).with_session(session)
    }

    fn end(tenant: &str, session: &str, ts: f64) -> Event {
        Event::new(tenant, SESSION_END, ts).with_session(session)
    }

    #[test]
    fn test_matched_pair() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 10.0));
        let outcome = tracker.on_event(&end("a", "s1", 25.0));

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
    fn test_unmatched_end_is_ignored() {
        let mut tracker = SessionTracker::new();
        assert_eq!(tracker.on_event(&end("a", "s2", 5.0)), SessionOutcome::Unmatched);
        assert_eq!(tracker.stats("a"), None);
    }

    #[test]
    fn test_last_start_wins() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 10.0));
        let outcome = tracker.on_event(&start("a", "s1", 20.0));
        assert_eq!(outcome, SessionOutcome::Started { replaced: Some(10.0) });

        tracker.on_event(&end("a", "s1", 25.0));
        assert_eq!(tracker.stats("a").map(|s| s.total_duration), Some(5.0));
    }

    #[test]
    fn test_duplicate_end_counts_once() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 10.0));
        tracker.on_event(&end("a", "s1", 20.0));
        assert_eq!(tracker.on_event(&end("a", "s1", 30.0)), SessionOutcome::Unmatched);
        assert_eq!(tracker.stats("a").map(|s| s.count), Some(1));
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 50.0));
        let outcome = tracker.on_event(&end("a", "s1", 40.0));

        assert_eq!(outcome, SessionOutcome::ClockAnomaly { duration: -10.0 });
        assert_eq!(tracker.stats("a"), None);
        assert_eq!(tracker.pending_start(&SessionKey::new("a", "s1")), Some(50.0));
    }

    #[test]
    fn test_zero_duration_counts() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 7.0));
        tracker.on_event(&end("a", "s1", 7.0));
        assert_eq!(
            tracker.stats("a"),
            Some(SessionStats {
                total_duration: 0.0,
                count: 1
            })
        );
    }

    #[test]
    fn test_sessions_are_scoped_by_tenant() {
        let mut tracker = SessionTracker::new();
        tracker.on_event(&start("a", "s1", 10.0));
        assert_eq!(tracker.on_event(&end("b", "s1", 20.0)), SessionOutcome::Unmatched);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_stats_accumulate_per_tenant() {
        let mut tracker = SessionTracker::new();
        for (session, s, e) in [("s1", 0.0, 10.0), ("s2", 5.0, 9.0), ("s3", 100.0, 130.0)] {
            tracker.on_event(&start("a", session, s));
            tracker.on_event(&end("a", session, e));
        }
        tracker.on_event(&start("b", "x", 1.0));
        tracker.on_event(&end("b", "x", 2.0));

        let a = tracker.stats("a").unwrap();
        assert_eq!(a.count, 3);
        assert_eq!(a.total_duration, 44.0);
        assert_eq!(a.average_duration(), Some(44.0 / 3.0));
        assert_eq!(tracker.all_stats().count(), 2);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let mut tracker = SessionTracker::new();
        let click = Event::new("a", "click", 1.0).with_session("s1");
        assert_eq!(tracker.on_event(&click), SessionOutcome::Ignored);
        assert_eq!(tracker.pending_count(), 0);
    }
}
