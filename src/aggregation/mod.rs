//! Stateful aggregation: hopping-window counts and session durations

/// Hopping-window occurrence table
pub mod hopping_window;
/// Session start/end pairing and duration statistics
pub mod session;
/// Configuration types for windowing
pub mod config;
/// Records emitted to snapshot sinks
pub mod snapshot;

pub use config::WindowConfig;
pub use hopping_window::{IncrementOutcome, WindowKey, WindowView, WindowedCounter};
pub use session::{SessionKey, SessionOutcome, SessionStats, SessionTracker};
pub use snapshot::{SessionSnapshot, SnapshotRecord, WindowSnapshot};

/// Exclusive owner of all aggregation state for one key partition
///
/// One engine belongs to one worker; nothing else holds references into it.
#[derive(Debug)]
pub struct AggregationEngine {
    counter: WindowedCounter,
    sessions: SessionTracker,
}

impl AggregationEngine {
    /// Create an engine with empty state
    pub fn new(config: WindowConfig) -> Self {
        Self {
            counter: WindowedCounter::new(config),
            sessions: SessionTracker::new(),
        }
    }

    /// Window table
    pub fn counter(&self) -> &WindowedCounter {
        &self.counter
    }

    /// Mutable window table
    pub fn counter_mut(&mut self) -> &mut WindowedCounter {
        &mut self.counter
    }

    /// Session tracker
    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Mutable session tracker
    pub fn sessions_mut(&mut self) -> &mut SessionTracker {
        &mut self.sessions
    }

    /// Evict expired windows against the highest timestamp seen so far
    pub fn sweep_to_stream_time(&mut self) -> usize {
        match self.counter.stream_time() {
            Some(now) => self.counter.sweep(now),
            None => 0,
        }
    }
}
