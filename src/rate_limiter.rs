use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::info;

/// Length of the sliding window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Extra wait after the oldest call leaves the window.
pub const SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Time source for [`RateLimiter`], measured from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Sliding-window calls-per-minute gate.
///
/// Keeps the timestamps of calls made in the last minute. When the window
/// is full, [`RateLimiter::acquire`] blocks until the oldest one expires.
pub struct RateLimiter {
    requests_per_minute: usize,
    calls: VecDeque<Duration>,
    clock: Box<dyn Clock>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self::with_clock(requests_per_minute, Box::new(SystemClock::default()))
    }

    pub fn with_clock(requests_per_minute: usize, clock: Box<dyn Clock>) -> Self {
        Self {
            requests_per_minute,
            calls: VecDeque::with_capacity(requests_per_minute),
            clock,
        }
    }

    pub fn requests_per_minute(&self) -> usize {
        self.requests_per_minute
    }

    /// Block until a call is allowed, then register it.
    ///
    /// Returns the registered call time. A limit of zero disables the gate.
    pub fn acquire(&mut self) -> Duration {
        if self.requests_per_minute == 0 {
            return self.clock.now();
        }

        self.prune(self.clock.now());
        while self.calls.len() >= self.requests_per_minute {
            let Some(&oldest) = self.calls.front() else {
                break;
            };
            let now = self.clock.now();
            let wait = (oldest + WINDOW + SAFETY_MARGIN).saturating_sub(now);
            info!(
                wait_ms = wait.as_millis() as u64,
                rpm = self.requests_per_minute,
                "extraction rate limit reached, waiting"
            );
            self.clock.sleep(wait);
            self.prune(self.clock.now());
        }

        let now = self.clock.now();
        self.calls.push_back(now);
        now
    }

    /// Calls currently inside the window.
    pub fn in_window(&self) -> usize {
        self.calls.len()
    }

    fn prune(&mut self, now: Duration) {
        while let Some(&oldest) = self.calls.front() {
            if now.saturating_sub(oldest) >= WINDOW {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("requests_per_minute", &self.requests_per_minute)
            .field("in_window", &self.calls.len())
            .finish_non_exhaustive()
    }
}
