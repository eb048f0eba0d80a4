//! Graceful shutdown: refuse new work, then drain what was admitted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

/// Drain timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How often the in-flight counter is checked, in milliseconds.
    pub poll_interval_ms: u64,
    /// Longest time to wait for in-flight requests, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            drain_timeout_ms: 10_000,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every admitted request finished.
    Drained,
    /// The timeout elapsed with requests still running.
    TimedOut {
        /// Requests still in flight.
        remaining: usize,
    },
}

#[derive(Debug, Default)]
struct State {
    closing: AtomicBool,
    in_flight: AtomicUsize,
}

/// Closing flag plus in-flight counter shared by every dispatch task.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    state: Arc<State>,
}

/// Marks one admitted request. Dropping it decrements the in-flight counter.
#[derive(Debug)]
pub struct InFlightGuard {
    state: Arc<State>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ShutdownCoordinator {
    /// Create an open coordinator.
    #[must_use]
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    /// Admit one request, unless shutdown has begun.
    ///
    /// The counter is raised before the flag is re-checked, so a request that
    /// races with [`begin_shutdown`](Self::begin_shutdown) is either refused or
    /// seen by [`drain`](Self::drain).
    #[must_use]
    pub fn try_enter(&self) -> Option<InFlightGuard> {
        if self.is_closing() {
            return None;
        }

        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            state: Arc::clone(&self.state),
        };

        if self.is_closing() {
            return None;
        }

        Some(guard)
    }

    /// Set the closing flag. Later requests are answered with a closing status.
    pub fn begin_shutdown(&self) {
        if !self.state.closing.swap(true, Ordering::AcqRel) {
            info!(
                "shutdown started with {} requests in flight",
                self.in_flight()
            );
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }

    /// Requests currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no request is in flight or the drain timeout elapses.
    pub async fn drain(&self) -> DrainOutcome {
        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                info!("all in-flight requests drained");
                return DrainOutcome::Drained;
            }

            if Instant::now() >= deadline {
                warn!("drain timed out with {} requests in flight", remaining);
                return DrainOutcome::TimedOut { remaining };
            }

            sleep(poll).await;
        }
    }

    /// Begin shutdown and drain.
    pub async fn shutdown(&self) -> DrainOutcome {
        self.begin_shutdown();
        self.drain().await
    }
}
