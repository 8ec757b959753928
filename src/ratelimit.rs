//! Adaptive rate limiting for the online resolver, plus the cancellation
//! primitive shared with the batch orchestrator.
//!
//! The limiter keeps the timestamps of the most recent requests in a
//! bounded window; when the window is full it sleeps out the remainder of
//! the 60-second span. The sleep is interruptible: cancellation wakes it
//! within the condvar latency, never the full window. No lock is held
//! while sleeping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::AdaptiveRateConfig;

const WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation: one token per run, cloned into every worker.
/// `cancel()` wakes all interruptible sleeps immediately.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for up to `dur`, waking early on cancellation.
    /// Returns `true` if the full duration elapsed, `false` if cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (next, _timeout) = self.inner.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Bounded request window with adaptive capacity.
///
/// On a 403 the effective rpm drops multiplicatively and one worker slot is
/// withdrawn; after a quiet cooldown the rpm ramps back additively and the
/// slot returns. The discovered value can be read back for persistence.
pub struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
    rpm: AtomicU32,
    max_rpm: u32,
    /// Online worker slots currently allowed.
    slots: AtomicUsize,
    max_slots: usize,
    throttle_state: Mutex<ThrottleState>,
    config: AdaptiveRateConfig,
}

struct ThrottleState {
    last_403: Option<Instant>,
    last_ramp: Instant,
}

impl RateLimiter {
    /// `rpm` is the user-configured ceiling; adaptive discovery never
    /// exceeds it. `workers` caps the parallel slot count.
    pub fn new(rpm: u32, workers: usize, config: AdaptiveRateConfig) -> RateLimiter {
        let start_rpm = rpm.min(config.discovery_rpm).max(1);
        RateLimiter {
            window: Mutex::new(VecDeque::with_capacity(start_rpm as usize)),
            rpm: AtomicU32::new(start_rpm),
            max_rpm: rpm.max(1),
            slots: AtomicUsize::new(workers.max(1)),
            max_slots: workers.max(1),
            throttle_state: Mutex::new(ThrottleState {
                last_403: None,
                last_ramp: Instant::now(),
            }),
            config,
        }
    }

    pub fn current_rpm(&self) -> u32 {
        self.rpm.load(Ordering::Relaxed)
    }

    pub fn current_slots(&self) -> usize {
        self.slots.load(Ordering::Relaxed)
    }

    /// Block until a request slot is free within the rolling window.
    /// Returns `false` if cancelled while waiting.
    pub fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let wait = {
                let mut window = self.window.lock().unwrap();
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= WINDOW)
                {
                    window.pop_front();
                }
                let capacity = self.rpm.load(Ordering::Relaxed) as usize;
                if window.len() < capacity {
                    window.push_back(now);
                    return true;
                }
                // Sleep until the oldest stamp ages out of the window.
                match window.front() {
                    Some(oldest) => WINDOW.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::from_millis(10),
                }
            };
            if !cancel.sleep(wait) {
                return false;
            }
        }
    }

    /// A 403 was observed: multiplicative rpm backoff, drop a worker slot.
    pub fn record_rate_limited(&self) {
        let mut state = self.throttle_state.lock().unwrap();
        state.last_403 = Some(Instant::now());
        let current = self.rpm.load(Ordering::Relaxed);
        let reduced = ((current as f64 * self.config.backoff_factor) as u32).max(1);
        self.rpm.store(reduced, Ordering::Relaxed);
        let slots = self.slots.load(Ordering::Relaxed);
        if slots > 1 {
            self.slots.store(slots - 1, Ordering::Relaxed);
        }
        tracing::warn!(rpm = reduced, slots = slots.saturating_sub(1), "403 received, backing off");
    }

    /// A successful response: after a quiet cooldown, additive ramp-up.
    pub fn record_success(&self) {
        let mut state = self.throttle_state.lock().unwrap();
        let now = Instant::now();
        let quiet = state
            .last_403
            .map_or(true, |t| now.duration_since(t).as_secs() >= self.config.cooldown_secs);
        let ramp_due =
            now.duration_since(state.last_ramp).as_secs() >= self.config.cooldown_secs;
        if quiet && ramp_due {
            state.last_ramp = now;
            let current = self.rpm.load(Ordering::Relaxed);
            if current < self.max_rpm {
                let raised = (current + self.config.ramp_step_rpm).min(self.max_rpm);
                self.rpm.store(raised, Ordering::Relaxed);
                tracing::debug!(rpm = raised, "ramping rate limit back up");
            }
            let slots = self.slots.load(Ordering::Relaxed);
            if slots < self.max_slots {
                self.slots.store(slots + 1, Ordering::Relaxed);
            }
        }
    }
}

// ============================================================================
// Worker gate
// ============================================================================

/// Counting gate bounding how many workers may be inside the online
/// resolver at once. The cap shrinks and grows with the limiter's slot
/// count, so 403 backoff takes effect at the resolver layer, not the pool.
pub struct WorkerGate {
    active: Mutex<usize>,
    cv: Condvar,
}

impl WorkerGate {
    pub fn new() -> WorkerGate {
        WorkerGate {
            active: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Enter the gate, blocking while `cap()` is saturated.
    /// Returns `false` if cancelled while waiting.
    pub fn enter<F: Fn() -> usize>(&self, cap: F, cancel: &CancellationToken) -> bool {
        let mut active = self.active.lock().unwrap();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if *active < cap().max(1) {
                *active += 1;
                return true;
            }
            let (next, _) = self
                .cv
                .wait_timeout(active, Duration::from_millis(100))
                .unwrap();
            active = next;
        }
    }

    pub fn leave(&self) {
        let mut active = self.active.lock().unwrap();
        *active = active.saturating_sub(1);
        self.cv.notify_one();
    }
}

impl Default for WorkerGate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
