use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::WindowConfig;
use crate::event::Event;

/// Identity of a counted series: one tenant, one event type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// Tenant identifier
    pub tenant_id: String,
    /// Event type
    pub event_type: String,
}

impl WindowKey {
    /// Create a key from its parts
    pub fn new(tenant_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
        }
    }
}

impl From<&Event> for WindowKey {
    fn from(event: &Event) -> Self {
        Self::new(event.tenant_id.clone(), event.event_type.clone())
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.event_type)
    }
}

/// Read-only copy of one window's state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowView {
    /// Inclusive start, in seconds
    pub start: f64,
    /// Exclusive end, in seconds
    pub end: f64,
    /// Number of events counted
    pub count: u64,
}

/// Result of a single increment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementOutcome {
    /// Windows whose count was bumped
    pub updated: usize,
    /// Bumped windows that were already past their grace period relative to
    /// the key's watermark; the next sweep of the key reclaims them
    pub behind_watermark: usize,
}

impl IncrementOutcome {
    /// Every covering window was already past its grace period
    pub fn is_late(&self) -> bool {
        self.updated > 0 && self.behind_watermark == self.updated
    }
}

/// Window geometry in integer nanoseconds, so alignment is exact
#[derive(Debug, Clone, Copy)]
struct Geometry {
    step: i128,
    size: i128,
    expiry: i128,
    per_instant: i128,
}

impl Geometry {
    fn new(config: &WindowConfig) -> Self {
        Self {
            step: config.step.as_nanos() as i128,
            size: config.size.as_nanos() as i128,
            expiry: config.expiry.as_nanos() as i128,
            per_instant: config.windows_per_instant() as i128,
        }
    }

    /// Index of the latest-starting window covering `ts`
    fn latest_index(&self, ts: f64) -> i128 {
        to_nanos(ts).div_euclid(self.step)
    }

    fn start_nanos(&self, index: i128) -> i128 {
        index.saturating_mul(self.step)
    }

    fn is_expired(&self, index: i128, now: i128) -> bool {
        self.start_nanos(index)
            .saturating_add(self.size)
            .saturating_add(self.expiry)
            < now
    }

    fn view(&self, index: i128, count: u64) -> WindowView {
        let start = self.start_nanos(index);
        WindowView {
            start: from_nanos(start),
            end: from_nanos(start.saturating_add(self.size)),
            count,
        }
    }
}

/// Saturates outside the `i128` range, roughly 1.7e29 seconds
fn to_nanos(secs: f64) -> i128 {
    (secs * 1e9).round() as i128
}

fn from_nanos(nanos: i128) -> f64 {
    nanos as f64 / 1e9
}

/// Windows owned by one key, ordered by start index
#[derive(Debug, Default)]
struct KeyWindows {
    windows: BTreeMap<i128, u64>,
    watermark: Option<f64>,
}

impl KeyWindows {
    fn observe(&mut self, ts: f64) -> f64 {
        let watermark = match self.watermark {
            Some(current) if current >= ts => current,
            _ => ts,
        };
        self.watermark = Some(watermark);
        watermark
    }

    fn apply(&mut self, geometry: &Geometry, ts: f64) -> IncrementOutcome {
        let watermark = to_nanos(self.observe(ts));
        let latest = geometry.latest_index(ts);
        let mut outcome = IncrementOutcome::default();

        // Expired windows are still counted; only a sweep removes state
        for index in (latest - geometry.per_instant + 1)..=latest {
            if geometry.is_expired(index, watermark) {
                outcome.behind_watermark += 1;
            }
            *self.windows.entry(index).or_insert(0) += 1;
            outcome.updated += 1;
        }

        outcome
    }

    fn evict(&mut self, geometry: &Geometry, now: i128) -> usize {
        let mut evicted = 0;
        while let Some((&index, _)) = self.windows.first_key_value() {
            if !geometry.is_expired(index, now) {
                break;
            }
            self.windows.pop_first();
            evicted += 1;
        }
        evicted
    }
}

/// Hopping-window occurrence table keyed by (tenant, event type)
///
/// Window starts are aligned to multiples of `step`; `size / step` windows cover
/// every instant, so one event bumps that many counters regardless of how old
/// it is. Each key tracks the highest timestamp it has seen, which drives
/// [`sweep_key`](Self::sweep_key); counts never depend on arrival order.
#[derive(Debug)]
pub struct WindowedCounter {
    config: WindowConfig,
    geometry: Geometry,
    keys: HashMap<WindowKey, KeyWindows>,
    stream_time: Option<f64>,
}

impl WindowedCounter {
    /// Create an empty table
    ///
    /// The configuration is expected to have passed [`WindowConfig::validate`].
    pub fn new(config: WindowConfig) -> Self {
        Self {
            geometry: Geometry::new(&config),
            config,
            keys: HashMap::new(),
            stream_time: None,
        }
    }

    /// Window configuration
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Count one occurrence at `ts` in every window covering it
    pub fn increment(&mut self, key: &WindowKey, ts: f64) -> IncrementOutcome {
        let geometry = self.geometry;
        let outcome = match self.keys.get_mut(key) {
            Some(state) => state.apply(&geometry, ts),
            None => self.keys.entry(key.clone()).or_default().apply(&geometry, ts),
        };

        if self.stream_time.map_or(true, |current| ts > current) {
            self.stream_time = Some(ts);
        }

        if outcome.is_late() {
            debug!(key = %key, ts, "Late event: every covering window is past its grace period");
        }

        outcome
    }

    /// Count of the latest-starting window covering `ts`, or 0 if it does not exist
    pub fn current(&self, key: &WindowKey, ts: f64) -> u64 {
        let index = self.geometry.latest_index(ts);
        self.keys
            .get(key)
            .and_then(|state| state.windows.get(&index))
            .copied()
            .unwrap_or(0)
    }

    /// Evict every window whose grace period ended before `now`
    ///
    /// Returns the number of windows removed. Keys left without windows are
    /// dropped as well.
    pub fn sweep(&mut self, now: f64) -> usize {
        let geometry = self.geometry;
        let now = to_nanos(now);
        let mut evicted = 0;

        self.keys.retain(|_, state| {
            evicted += state.evict(&geometry, now);
            !state.windows.is_empty()
        });

        if evicted > 0 {
            debug!(evicted, remaining_keys = self.keys.len(), "Swept expired windows");
        }
        evicted
    }

    /// Sweep a single key against its own watermark
    pub fn sweep_key(&mut self, key: &WindowKey) -> usize {
        let geometry = self.geometry;
        let Some(state) = self.keys.get_mut(key) else {
            return 0;
        };
        let Some(watermark) = state.watermark else {
            return 0;
        };

        let evicted = state.evict(&geometry, to_nanos(watermark));
        if state.windows.is_empty() {
            self.keys.remove(key);
        }
        evicted
    }

    /// Highest timestamp seen for `key`
    pub fn watermark(&self, key: &WindowKey) -> Option<f64> {
        self.keys.get(key).and_then(|state| state.watermark)
    }

    /// Highest timestamp seen across all keys
    pub fn stream_time(&self) -> Option<f64> {
        self.stream_time
    }

    /// Live windows of `key`, oldest first
    pub fn windows(&self, key: &WindowKey) -> Vec<WindowView> {
        self.keys
            .get(key)
            .map(|state| {
                state
                    .windows
                    .iter()
                    .map(|(&index, &count)| self.geometry.view(index, count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of keys with live state
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of live windows across all keys
    pub fn window_count(&self) -> usize {
        self.keys.values().map(|state| state.windows.len()).sum()
    }
}
