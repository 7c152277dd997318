//! Request throttle in front of every backend call.
//!
//! Two limits apply to each admitted task:
//!
//! - at most `ceiling` tasks run at once (fair semaphore)
//! - successive task starts are at least `min_start_gap` apart (`StartSlot`)
//!
//! Waiters queue on the start slot, a FIFO async mutex, and hold it while
//! they wait for a permit. Starts therefore happen in arrival order and no
//! later caller can overtake an earlier one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use encore_core::{GatewayResult, ThrottleConfig, TransportError};
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio::time::Instant;

// ============================================================================
// START SLOT
// ============================================================================

/// Serialized start slot enforcing a minimum gap between starts.
#[derive(Debug)]
pub struct StartSlot {
    last_start: Mutex<Option<Instant>>,
    gap: Duration,
}

/// Exclusive turn at the start slot. Dropping it lets the next waiter in.
pub struct SlotTurn<'a> {
    last_start: MutexGuard<'a, Option<Instant>>,
    gap: Duration,
}

impl StartSlot {
    pub fn new(gap: Duration) -> Self {
        Self {
            last_start: Mutex::new(None),
            gap,
        }
    }

    /// Wait for this caller's turn. Turns are granted in FIFO order.
    pub async fn turn(&self) -> SlotTurn<'_> {
        SlotTurn {
            last_start: self.last_start.lock().await,
            gap: self.gap,
        }
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }
}

impl SlotTurn<'_> {
    /// Sleep until the gap since the previous start has elapsed, then
    /// record this start. Returns the recorded start time.
    pub async fn pace(mut self) -> Instant {
        if let Some(last) = *self.last_start {
            tokio::time::sleep_until(last + self.gap).await;
        }
        let now = Instant::now();
        *self.last_start = Some(now);
        now
    }
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Concurrency ceiling plus start pacing, shared by all outbound calls.
#[derive(Debug)]
pub struct RequestThrottle {
    permits: Semaphore,
    slot: StartSlot,
    ceiling: usize,
    backpressure_threshold: usize,
    queued: AtomicUsize,
    active: AtomicUsize,
    backpressure_warned: AtomicBool,
    backpressure_warnings: AtomicU64,
}

impl RequestThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let ceiling = config.ceiling.max(1);
        Self {
            permits: Semaphore::new(ceiling),
            slot: StartSlot::new(config.min_start_gap),
            ceiling,
            backpressure_threshold: config.backpressure_threshold(),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            backpressure_warned: AtomicBool::new(false),
            backpressure_warnings: AtomicU64::new(0),
        }
    }

    /// Run `task` once a permit and a start slot are both available.
    ///
    /// The task is not polled before admission. Fails with
    /// `TransportError::Closed` once the throttle is closed.
    pub async fn admit<F, T>(&self, task: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        let queued = Queued::enter(self);

        let turn = self.slot.turn().await;
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;
        let started_at = turn.pace().await;
        drop(queued);

        let _active = Active::enter(&self.active);
        tracing::trace!(
            active = self.active.load(Ordering::Relaxed),
            queued = self.queued.load(Ordering::Relaxed),
            ?started_at,
            "Admitted backend call"
        );

        let result = task.await;
        drop(permit);
        result
    }

    /// Stop admitting. Waiting and future callers fail with `Closed`;
    /// running tasks finish normally.
    pub fn close(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            tracing::info!(
                queued = self.queued.load(Ordering::Relaxed),
                active = self.active.load(Ordering::Relaxed),
                "Request throttle closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Tasks waiting for admission.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn min_start_gap(&self) -> Duration {
        self.slot.gap()
    }

    /// True from the warning until the queue drains to half the threshold.
    pub fn is_backpressured(&self) -> bool {
        self.backpressure_warned.load(Ordering::Relaxed)
    }

    /// Backpressure warnings logged so far.
    pub fn backpressure_warnings(&self) -> u64 {
        self.backpressure_warnings.load(Ordering::Relaxed)
    }

    fn note_depth(&self, depth: usize) {
        if depth > self.backpressure_threshold {
            if !self.backpressure_warned.swap(true, Ordering::Relaxed) {
                self.backpressure_warnings.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    depth,
                    ceiling = self.ceiling,
                    threshold = self.backpressure_threshold,
                    "Backend request queue is backing up"
                );
            }
        } else if depth <= self.backpressure_threshold / 2 {
            self.backpressure_warned.store(false, Ordering::Relaxed);
        }
    }
}

/// Counts a waiting caller for as long as it is queued.
struct Queued<'a> {
    throttle: &'a RequestThrottle,
}

impl<'a> Queued<'a> {
    fn enter(throttle: &'a RequestThrottle) -> Self {
        let depth = throttle.queued.fetch_add(1, Ordering::Relaxed) + 1;
        throttle.note_depth(depth);
        Self { throttle }
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        let depth = self.throttle.queued.fetch_sub(1, Ordering::Relaxed) - 1;
        self.throttle.note_depth(depth);
    }
}

struct Active<'a>(&'a AtomicUsize);

impl<'a> Active<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
