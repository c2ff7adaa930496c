//! Monotonic time sources for [`Debounce`](crate::Debounce) and
//! [`Throttle`](crate::Throttle).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Milliseconds since a clock's epoch. Never decreases for a given clock.
pub type TimestampMillis = u64;

/// Provides monotonic millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now_millis(&self) -> TimestampMillis;

    /// Returns the number of milliseconds elapsed since `since`.
    ///
    /// Saturates at zero if `since` lies in the future.
    fn elapsed_millis(&self, since: TimestampMillis) -> u64 {
        self.now_millis().saturating_sub(since)
    }
}

/// A clock backed by [`Instant`], counting from the moment it was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// A shared system clock, the default for all primitives.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> TimestampMillis {
        self.epoch.elapsed().as_millis() as TimestampMillis
    }
}

/// A clock that only moves when told to.
///
/// Intended for tests that need exact control over elapsed time.
///
/// ```
/// use horizon_lattice_sync::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now_millis(), 250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Jump to an absolute timestamp. Earlier timestamps are ignored.
    pub fn set(&self, millis: TimestampMillis) {
        self.now.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> TimestampMillis {
        self.now.load(Ordering::Acquire)
    }
}

/// Convert a [`Duration`] to whole milliseconds.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
