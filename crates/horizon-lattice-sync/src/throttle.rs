//! Keyed rate limiting.
//!
//! A [`Throttle`] accepts at most one in-flight operation per key, and spaces
//! accepted operations by at least an interval measured from the start of the
//! previous accepted one. Rejected calls are dropped silently: nothing is
//! queued or retried.
//!
//! # Caller obligation
//!
//! Every accepted [`check_and_set_state`](Throttle::check_and_set_state) must
//! eventually be followed by [`set_finished`](Throttle::set_finished) for the
//! same key. A key that is never marked finished rejects every later call,
//! forever. [`Throttle::throttle`], [`Throttle::throttle_async`] and
//! [`ThrottlePermit`] discharge the obligation automatically.
//!
//! ```
//! use horizon_lattice_sync::Throttle;
//! use std::time::Duration;
//!
//! let throttle = Throttle::<&'static str>::new();
//!
//! let saved = throttle.throttle("save", || "saved");
//! assert_eq!(saved, Some("saved"));
//!
//! // Too soon after the previous save.
//! assert_eq!(throttle.throttle("save", || "saved"), None);
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::clock::{Clock, SystemClock, TimestampMillis, duration_millis};
use crate::key::Key;
use crate::logging::targets;
use crate::singleton::SingletonRegistry;

/// Default spacing between accepted calls.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    /// Start time of the last accepted call.
    last_invoke: TimestampMillis,
    /// Whether the last accepted call has been marked finished.
    finished: bool,
}

/// Per-key rate limiter.
pub struct Throttle<K: Key> {
    states: RwLock<HashMap<K, Arc<Mutex<ThrottleState>>>>,
    clock: Arc<dyn Clock>,
    default_interval: Duration,
}

impl<K: Key> Throttle<K> {
    /// Create a throttle with the system clock and a 300ms default interval.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create a throttle driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            clock,
            default_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }

    /// Set the interval used by the methods that don't take one.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    /// The process-wide throttle for keys of type `K`.
    pub fn global() -> Arc<Self> {
        SingletonRegistry::global().get_or_create::<Self>()
    }

    /// The interval used when none is given.
    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Try to start an operation for `key`.
    ///
    /// The first call for a key always passes. Later calls pass only if the
    /// previous operation was marked finished and at least `interval` has
    /// elapsed since it started. A passing call marks the key unfinished and
    /// records the new start time; the caller must then call
    /// [`set_finished`](Self::set_finished).
    pub fn check_and_set_state(&self, key: K, interval: Duration) -> bool {
        let now = self.clock.now_millis();

        let existing = self.states.read().get(&key).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => match self.states.write().entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Mutex::new(ThrottleState {
                        last_invoke: now,
                        finished: false,
                    })));
                    tracing::debug!(target: targets::THROTTLE, ?key, "first call accepted");
                    return true;
                }
            },
        };

        let mut state = slot.lock();
        if !state.finished {
            tracing::trace!(target: targets::THROTTLE, ?key, "rejected, previous call unfinished");
            return false;
        }
        if self.clock.elapsed_millis(state.last_invoke) < duration_millis(interval) {
            tracing::trace!(target: targets::THROTTLE, ?key, "rejected, interval not elapsed");
            return false;
        }

        state.finished = false;
        state.last_invoke = now;
        tracing::trace!(target: targets::THROTTLE, ?key, "call accepted");
        true
    }

    /// Mark the operation for `key` as finished. Unknown keys are ignored.
    pub fn set_finished(&self, key: &K) {
        if let Some(slot) = self.states.read().get(key) {
            slot.lock().finished = true;
        }
    }

    /// Check whether `key` has no unfinished operation. Unknown keys count as finished.
    pub fn is_finished(&self, key: &K) -> bool {
        self.states
            .read()
            .get(key)
            .is_none_or(|slot| slot.lock().finished)
    }

    /// Try to start an operation with the default interval, returning a
    /// permit that marks it finished when dropped.
    pub fn try_acquire(&self, key: K) -> Option<ThrottlePermit<'_, K>> {
        self.try_acquire_with(key, self.default_interval)
    }

    /// Like [`try_acquire`](Self::try_acquire) with an explicit interval.
    pub fn try_acquire_with(&self, key: K, interval: Duration) -> Option<ThrottlePermit<'_, K>> {
        if self.check_and_set_state(key.clone(), interval) {
            Some(ThrottlePermit {
                throttle: self,
                key,
            })
        } else {
            None
        }
    }

    /// Run `callback` if the throttle accepts the call, then mark it finished.
    ///
    /// Returns `None` if the call was rejected. The key is marked finished
    /// even if `callback` panics.
    pub fn throttle<F, R>(&self, key: K, callback: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        self.throttle_with(key, self.default_interval, callback)
    }

    /// [`throttle`](Self::throttle) with an explicit interval.
    pub fn throttle_with<F, R>(&self, key: K, interval: Duration, callback: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let _permit = self.try_acquire_with(key, interval)?;
        Some(callback())
    }

    /// Async form of [`throttle`](Self::throttle).
    ///
    /// The key is marked finished once the future completes, or when it is
    /// dropped before completing.
    pub async fn throttle_async<F, Fut, R>(&self, key: K, callback: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self.try_acquire(key)?;
        Some(callback().await)
    }

    /// Drop all state for `key`, so its next call is treated as a first call.
    pub fn remove(&self, key: &K) -> bool {
        self.states.write().remove(key).is_some()
    }

    /// Number of keys with throttle state.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Returns `true` if no key has throttle state.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl<K: Key> Default for Throttle<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> std::fmt::Debug for Throttle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("keys", &self.len())
            .field("default_interval", &self.default_interval)
            .finish()
    }
}

static_assertions::assert_impl_all!(Throttle<String>: Send, Sync);

/// An accepted throttled operation. Marks its key finished on drop.
#[must_use = "dropping the permit immediately marks the operation finished"]
pub struct ThrottlePermit<'a, K: Key> {
    throttle: &'a Throttle<K>,
    key: K,
}

impl<K: Key> ThrottlePermit<'_, K> {
    /// The key this permit was issued for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Mark the operation finished now.
    pub fn finish(self) {}
}

impl<K: Key> Drop for ThrottlePermit<'_, K> {
    fn drop(&mut self) {
        self.throttle.set_finished(&self.key);
    }
}

impl<K: Key> std::fmt::Debug for ThrottlePermit<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlePermit").field("key", &self.key).finish()
    }
}

/// [`Throttle::check_and_set_state`] on the process-wide throttle for `K`.
pub fn check_and_set_state<K: Key>(key: K, interval: Duration) -> bool {
    Throttle::<K>::global().check_and_set_state(key, interval)
}

/// [`Throttle::set_finished`] on the process-wide throttle for `K`.
pub fn set_finished<K: Key>(key: &K) {
    Throttle::<K>::global().set_finished(key)
}

/// [`Throttle::is_finished`] on the process-wide throttle for `K`.
pub fn is_finished<K: Key>(key: &K) -> bool {
    Throttle::<K>::global().is_finished(key)
}

/// [`Throttle::throttle`] on the process-wide throttle for `K`.
pub fn throttle<K, F, R>(key: K, callback: F) -> Option<R>
where
    K: Key,
    F: FnOnce() -> R,
{
    Throttle::<K>::global().throttle(key, callback)
}
