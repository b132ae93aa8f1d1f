//! Backpressure control for the consumer
//!
//! Messages are never dropped. When too many messages are read but not yet
//! processed, the consumer pauses its partition assignment; it resumes once
//! workers have drained below the low-water mark.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, info};

/// Inflight counter with pause/resume hysteresis
#[derive(Debug)]
pub struct BackpressureController {
    max_inflight: usize,
    pause_at: usize,
    resume_at: usize,
    inflight: AtomicUsize,
    paused: AtomicBool,
}

impl BackpressureController {
    /// Create a controller; thresholds are fractions of `max_inflight`
    pub fn new(max_inflight: usize, pause_threshold: f64, resume_threshold: f64) -> Self {
        let max_inflight = max_inflight.max(1);
        let pause_at = ((max_inflight as f64 * pause_threshold).ceil() as usize).clamp(1, max_inflight);
        let resume_at = ((max_inflight as f64 * resume_threshold).floor() as usize).min(pause_at - 1);

        Self {
            max_inflight,
            pause_at,
            resume_at,
            inflight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }
    }

    /// Count a message handed to a worker
    pub fn acquire(&self) {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Inflight messages: {}/{}", count, self.max_inflight);
    }

    /// Count a message finished by a worker
    pub fn release(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Messages read but not finished
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Whether the assignment is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True exactly once when inflight crosses the high-water mark
    pub fn should_pause(&self) -> bool {
        if self.inflight() >= self.pause_at
            && self
                .paused
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(
                "Pausing consumption: {} inflight (high water {})",
                self.inflight(),
                self.pause_at
            );
            return true;
        }
        false
    }

    /// True exactly once when a paused consumer drains to the low-water mark
    pub fn should_resume(&self) -> bool {
        if self.inflight() <= self.resume_at
            && self
                .paused
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(
                "Resuming consumption: {} inflight (low water {})",
                self.inflight(),
                self.resume_at
            );
            return true;
        }
        false
    }
}
