use serde::{Deserialize, Serialize};

/// Occurrence count of the current window for one (tenant, event type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Tenant identifier
    pub tenant: String,
    /// Event type
    pub event_type: String,
    /// Count of the latest-starting window covering the event
    pub occurrences: u64,
    /// Window size in seconds
    pub window_size: f64,
}

/// Session duration totals for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Tenant identifier
    pub tenant: String,
    /// Sum of completed session durations, in seconds
    pub total_duration: f64,
    /// Number of completed sessions
    pub count: u64,
}

/// Append-only record handed to a snapshot sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotRecord {
    /// Window occurrence snapshot
    Window(WindowSnapshot),
    /// Session statistics snapshot
    Session(SessionSnapshot),
}

impl SnapshotRecord {
    /// Tenant the record belongs to
    pub fn tenant(&self) -> &str {
        match self {
            SnapshotRecord::Window(w) => &w.tenant,
            SnapshotRecord::Session(s) => &s.tenant,
        }
    }
}

impl From<WindowSnapshot> for SnapshotRecord {
    fn from(snapshot: WindowSnapshot) -> Self {
        SnapshotRecord::Window(snapshot)
    }
}

impl From<SessionSnapshot> for SnapshotRecord {
    fn from(snapshot: SessionSnapshot) -> Self {
        SnapshotRecord::Session(snapshot)
    }
}
