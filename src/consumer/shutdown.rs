//! Graceful shutdown management for the consumer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use super::backpressure::BackpressureController;
use super::error::{ConsumerError, ConsumerResult};

/// Shutdown signal shared by every consumer task
#[derive(Debug)]
pub struct ShutdownState {
    shutting_down: AtomicBool,
    shutdown_start: Mutex<Option<Instant>>,
    signal: watch::Sender<bool>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            shutting_down: AtomicBool::new(false),
            shutdown_start: Mutex::new(None),
            signal,
        }
    }

    /// Begin the shutdown process; later calls are no-ops
    pub fn begin_shutdown(&self, reason: &str) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shutdown_start.lock() = Some(Instant::now());
        self.signal.send_replace(true);
        info!("Shutdown initiated: {}", reason);
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver that changes when shutdown begins
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Resolve once shutdown has begun
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|&stopping| stopping).await;
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for inflight messages to drain after shutdown begins
pub struct ShutdownCoordinator {
    state: Arc<ShutdownState>,
    backpressure: Arc<BackpressureController>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(
        state: Arc<ShutdownState>,
        backpressure: Arc<BackpressureController>,
        timeout: Duration,
    ) -> Self {
        Self {
            state,
            backpressure,
            timeout,
        }
    }

    /// Begin shutdown and wait for workers to finish their queues
    pub async fn shutdown(&self, reason: &str) -> ConsumerResult<()> {
        self.state.begin_shutdown(reason);

        let deadline = Instant::now() + self.timeout;
        let mut last_reported = None;

        loop {
            let inflight = self.backpressure.inflight();
            if inflight == 0 {
                break;
            }
            if Instant::now() > deadline {
                warn!("Shutdown timeout with {} messages still in flight", inflight);
                return Err(ConsumerError::Shutdown(format!(
                    "Timeout with {} messages in flight",
                    inflight
                )));
            }
            if last_reported != Some(inflight) {
                info!("Waiting for {} inflight messages to complete", inflight);
                last_reported = Some(inflight);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(elapsed) = self.state.shutdown_duration() {
            info!("Drained inflight messages in {:?}", elapsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_state() {
        let state = ShutdownState::new();
        let mut rx = state.subscribe();
        assert!(!state.is_shutting_down());

        state.begin_shutdown("test");
        state.begin_shutdown("again");
        assert!(state.is_shutting_down());
        assert!(rx.has_changed().unwrap());
        state.wait().await;
    }

    #[tokio::test]
    async fn test_coordinator_waits_for_drain() {
        let state = Arc::new(ShutdownState::new());
        let backpressure = Arc::new(BackpressureController::new(10, 0.8, 0.5));
        backpressure.acquire();

        let coordinator =
            ShutdownCoordinator::new(state.clone(), backpressure.clone(), Duration::from_secs(2));
        let handle = tokio::spawn(async move { coordinator.shutdown("test").await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        backpressure.release();

        assert!(handle.await.unwrap().is_ok());
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn test_coordinator_times_out() {
        let state = Arc::new(ShutdownState::new());
        let backpressure = Arc::new(BackpressureController::new(10, 0.8, 0.5));
        backpressure.acquire();

        let coordinator =
            ShutdownCoordinator::new(state, backpressure, Duration::from_millis(100));
        assert!(coordinator.shutdown("test").await.is_err());
    }
}
