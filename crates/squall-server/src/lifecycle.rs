//! Node lifecycle: health states, shutdown signal, in-flight tracking.
//!
//! State machine: `Starting -> Ready -> Draining -> Stopped`. The health
//! state sits behind an `ArcSwap` so hot paths read it lock-free; in-flight
//! work is counted with RAII guards so the drain count stays accurate even
//! when a handler panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Node health, transitioned by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Wiring up; not yet accepting work.
    Starting,
    /// Fully operational.
    Ready,
    /// Shutdown begun; no new work accepted, in-flight work draining.
    Draining,
    /// Drained and stopped.
    Stopped,
}

/// Coordinates startup readiness and graceful shutdown.
pub struct Lifecycle {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<HealthState>,
}

impl Lifecycle {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    /// Marks the node operational.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// The current health state.
    #[must_use]
    pub fn state(&self) -> HealthState {
        **self.state.load()
    }

    /// Whether new connections and operations should be admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == HealthState::Ready
    }

    /// A receiver that resolves once shutdown is triggered.
    #[must_use]
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every shutdown watcher.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        let _ = self.signal.send(true);
    }

    /// RAII guard counting one in-flight unit of work.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { in_flight: Arc::clone(&self.in_flight) }
    }

    /// The number of in-flight units.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight work to drain, up to `timeout`.
    ///
    /// Transitions to `Stopped` and returns `true` when drained; returns
    /// `false` (still `Draining`) when the deadline expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
