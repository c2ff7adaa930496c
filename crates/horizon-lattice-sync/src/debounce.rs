//! Debouncing of bursty callbacks.
//!
//! A [`Debounce`] collapses a burst of [`run`](Debounce::run) calls into a
//! single invocation of the most recent callback. Each armed instance owns a
//! named timer thread that ticks once per interval:
//!
//! - If enough time has passed since the last invocation, `run` invokes the
//!   callback right away on the calling thread.
//! - Otherwise the callback is parked as *pending*. Once no new call has
//!   arrived for a full interval, the timer invokes the pending callback.
//!   With `call_regular` set, the timer instead invokes it on every tick
//!   that saw a call.
//! - After [`NO_RESPONSE_TIMES`] ticks without any call the timer thread
//!   exits. The next `run` starts a new one.
//!
//! ```no_run
//! use std::time::Duration;
//! use horizon_lattice_sync::Debounce;
//!
//! let search = Debounce::builder()
//!     .interval(Duration::from_millis(250))
//!     .thread_name("search-debounce")
//!     .build();
//!
//! for query in ["h", "he", "hel", "hell", "hello"] {
//!     search.run(move || println!("searching for {query}"))?;
//! }
//! # Ok::<(), horizon_lattice_sync::SyncError>(())
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::clock::{Clock, SystemClock, TimestampMillis, duration_millis};
use crate::error::{Result, SyncError};
use crate::key::Key;
use crate::logging::{panic_message, span_names, targets};
use crate::singleton::SingletonRegistry;

/// Default debounce interval.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive idle ticks after which the timer thread stops.
pub const NO_RESPONSE_TIMES: u32 = 8;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for a [`Debounce`].
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet period, and the timer tick period.
    pub interval: Duration,
    /// Invoke the pending callback on every tick that saw a call, instead of
    /// waiting for a quiet period.
    pub call_regular: bool,
    /// Idle ticks before the timer thread stops.
    pub idle_ticks_before_pause: u32,
    /// Name of the timer thread.
    pub thread_name: String,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_DEBOUNCE_INTERVAL,
            call_regular: false,
            idle_ticks_before_pause: NO_RESPONSE_TIMES,
            thread_name: "horizon-debounce".to_string(),
        }
    }
}

impl DebounceConfig {
    /// Create a configuration with the given interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// Builder for [`Debounce`].
#[derive(Default)]
pub struct DebounceBuilder {
    config: DebounceConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl DebounceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Invoke on every active tick instead of after a quiet period.
    pub fn call_regular(mut self, call_regular: bool) -> Self {
        self.config.call_regular = call_regular;
        self
    }

    /// Set how many idle ticks stop the timer thread.
    pub fn idle_ticks_before_pause(mut self, ticks: u32) -> Self {
        self.config.idle_ticks_before_pause = ticks.max(1);
        self
    }

    /// Set the timer thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Use a specific clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the debouncer.
    pub fn build(self) -> Debounce {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        Debounce::with_clock(self.config, clock)
    }
}

struct DebounceState {
    pending: Option<Callback>,
    accessed: bool,
    last_access: TimestampMillis,
    last_invoke: TimestampMillis,
    idle_ticks: u32,
    /// Present while a timer thread is running. Dropping it stops the thread.
    timer: Option<Sender<()>>,
    disposed: bool,
}

struct Shared {
    config: DebounceConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<DebounceState>,
    invoke_lock: Mutex<()>,
    invocations: AtomicU64,
}

impl Shared {
    fn interval_millis(&self) -> u64 {
        duration_millis(self.config.interval)
    }

    /// Take the pending callback together with the invocation lock.
    ///
    /// Never waits: if another invocation is still running, the callback
    /// stays pending and `None` is returned. Taking both under the state lock
    /// keeps invocations in submission order.
    fn take_for_invoke<'a>(
        &'a self,
        state: &mut DebounceState,
        now: TimestampMillis,
    ) -> Option<(Callback, MutexGuard<'a, ()>)> {
        let serial = self.invoke_lock.try_lock()?;
        let callback = state.pending.take()?;
        state.accessed = false;
        state.last_invoke = now;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Some((callback, serial))
    }

    fn invoke_from_timer(&self, callback: Callback) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
            tracing::warn!(
                target: targets::DEBOUNCE,
                thread = %self.config.thread_name,
                panic = %panic_message(payload.as_ref()),
                "debounced callback panicked"
            );
        }
    }
}

/// Collapses bursts of calls into one invocation of the latest callback.
pub struct Debounce {
    shared: Arc<Shared>,
}

impl Debounce {
    /// Create a debouncer with the given configuration.
    pub fn new(config: DebounceConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a debouncer that reads time from `clock`.
    pub fn with_clock(config: DebounceConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                state: Mutex::new(DebounceState {
                    pending: None,
                    accessed: false,
                    last_access: now,
                    last_invoke: now,
                    idle_ticks: 0,
                    timer: None,
                    disposed: false,
                }),
                invoke_lock: Mutex::new(()),
                invocations: AtomicU64::new(0),
            }),
        }
    }

    /// Create a builder.
    pub fn builder() -> DebounceBuilder {
        DebounceBuilder::new()
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.shared.config.interval
    }

    /// Whether the timer invokes on every active tick.
    pub fn call_regular(&self) -> bool {
        self.shared.config.call_regular
    }

    /// Submit `callback` as the latest pending work.
    ///
    /// If a full interval has passed since the last invocation, `callback`
    /// runs before this returns, on the calling thread. Otherwise it replaces
    /// any pending callback and the timer invokes it later. The same happens
    /// when a previous callback is still running on the timer thread, so
    /// this never waits on another invocation.
    pub fn run<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let immediate = {
            let mut state = shared.state.lock();
            if state.disposed {
                return Err(SyncError::disposed("Debounce"));
            }

            let now = shared.clock.now_millis();
            state.accessed = true;
            state.last_access = now;
            state.idle_ticks = 0;
            state.pending = Some(Box::new(callback));

            if state.timer.is_none() {
                self.arm(&mut state)?;
            }

            if shared.clock.elapsed_millis(state.last_invoke) < shared.interval_millis() {
                None
            } else {
                let immediate = shared.take_for_invoke(&mut state, now);
                if immediate.is_none() {
                    tracing::trace!(target: targets::DEBOUNCE, "invocation in progress, deferred");
                }
                immediate
            }
        };

        if let Some((callback, _serial)) = immediate {
            tracing::trace!(target: targets::DEBOUNCE, "invoking immediately");
            callback();
        }
        Ok(())
    }

    /// Stop the timer and reject further calls. A pending callback is dropped.
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.pending = None;
        state.timer = None;
        tracing::debug!(
            target: targets::DEBOUNCE,
            thread = %self.shared.config.thread_name,
            "debounce disposed"
        );
    }

    /// Returns `true` once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Returns `true` while a timer thread is running.
    pub fn is_timer_running(&self) -> bool {
        self.shared.state.lock().timer.is_some()
    }

    /// Returns `true` if a callback is waiting for the timer.
    pub fn has_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }

    /// Number of callbacks invoked so far.
    pub fn invocation_count(&self) -> u64 {
        self.shared.invocations.load(Ordering::Relaxed)
    }

    fn arm(&self, state: &mut DebounceState) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let shared = self.shared.clone();

        thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || timer_loop(shared, stop_rx))?;

        state.timer = Some(stop_tx);
        tracing::debug!(
            target: targets::DEBOUNCE,
            thread = %self.shared.config.thread_name,
            interval_ms = self.shared.interval_millis(),
            "timer armed"
        );
        Ok(())
    }
}

fn timer_loop(shared: Arc<Shared>, stop: Receiver<()>) {
    let interval_ms = shared.interval_millis();
    let idle_limit = shared.config.idle_ticks_before_pause.max(1);

    loop {
        match stop.recv_timeout(shared.config.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // Disconnected: disposed.
            _ => break,
        }

        let _tick =
            tracing::trace_span!(target: targets::DEBOUNCE, span_names::DEBOUNCE_TICK).entered();

        let callback = {
            let mut state = shared.state.lock();
            if state.disposed {
                break;
            }

            if !state.accessed {
                state.idle_ticks += 1;
                if state.idle_ticks >= idle_limit {
                    state.idle_ticks = 0;
                    state.timer = None;
                    tracing::debug!(
                        target: targets::DEBOUNCE,
                        thread = %shared.config.thread_name,
                        "timer paused"
                    );
                    break;
                }
                continue;
            }

            state.idle_ticks = 0;
            let quiet = shared.clock.elapsed_millis(state.last_access) >= interval_ms;
            if shared.config.call_regular || quiet {
                // Busy with an immediate invocation: retry on the next tick.
                shared.take_for_invoke(&mut state, shared.clock.now_millis())
            } else {
                None
            }
        };

        if let Some((callback, _serial)) = callback {
            shared.invoke_from_timer(callback);
        }
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}

impl Drop for Debounce {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Debounce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debounce")
            .field("interval", &self.interval())
            .field("call_regular", &self.call_regular())
            .field("timer_running", &self.is_timer_running())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A function whose calls are debounced, so only the latest argument in a
/// burst is delivered.
///
/// ```no_run
/// use std::time::Duration;
/// use horizon_lattice_sync::{DebounceConfig, Debounced};
///
/// let resize = Debounced::new(
///     DebounceConfig::with_interval(Duration::from_millis(100)),
///     |(w, h): (u32, u32)| println!("relayout at {w}x{h}"),
/// );
/// resize.call((800, 600))?;
/// resize.call((1024, 768))?;
/// # Ok::<(), horizon_lattice_sync::SyncError>(())
/// ```
pub struct Debounced<T> {
    debounce: Debounce,
    target: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Debounced<T> {
    /// Wrap `target` in a debouncer built from `config`.
    pub fn new<F>(config: DebounceConfig, target: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            debounce: Debounce::new(config),
            target: Arc::new(target),
        }
    }

    /// Debounce a call with `arg`.
    pub fn call(&self, arg: T) -> Result<()> {
        let target = self.target.clone();
        self.debounce.run(move || target(arg))
    }

    /// The underlying debouncer.
    pub fn debounce(&self) -> &Debounce {
        &self.debounce
    }

    /// Dispose the underlying debouncer.
    pub fn dispose(&self) {
        self.debounce.dispose();
    }
}

/// A set of debouncers, one per key, created on first use.
pub struct KeyedDebouncer<K: Key> {
    config: DebounceConfig,
    clock: Arc<dyn Clock>,
    instances: RwLock<HashMap<K, Arc<Debounce>>>,
}

impl<K: Key> KeyedDebouncer<K> {
    /// Create a keyed debouncer whose instances use `config`.
    pub fn new(config: DebounceConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a keyed debouncer whose instances read time from `clock`.
    pub fn with_clock(config: DebounceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide keyed debouncer for keys of type `K`.
    pub fn global() -> Arc<Self> {
        SingletonRegistry::global().get_or_create::<Self>()
    }

    /// Debounce `callback` under `key`.
    pub fn run<F>(&self, key: K, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let config = self.config.clone();
        self.run_with(key, config, callback)
    }

    /// Debounce `callback` under `key`, creating the instance with `config`
    /// if it does not exist yet. An existing instance keeps its own config.
    pub fn run_with<F>(&self, key: K, config: DebounceConfig, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if key.is_absent() {
            return Err(SyncError::invalid_argument("debounce key", &key));
        }
        self.instance(key, config).run(callback)
    }

    /// Dispose and forget the instance for `key`.
    pub fn dispose(&self, key: &K) -> bool {
        match self.instances.write().remove(key) {
            Some(instance) => {
                instance.dispose();
                true
            }
            None => false,
        }
    }

    /// Returns `true` if an instance exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.instances.read().contains_key(key)
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Returns `true` if there are no live instances.
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    fn instance(&self, key: K, config: DebounceConfig) -> Arc<Debounce> {
        if let Some(instance) = self.instances.read().get(&key) {
            return instance.clone();
        }
        self.instances
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Debounce::with_clock(config, self.clock.clone())))
            .clone()
    }
}

impl<K: Key> Default for KeyedDebouncer<K> {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}

impl<K: Key> std::fmt::Debug for KeyedDebouncer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedDebouncer")
            .field("config", &self.config)
            .field("instances", &self.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(Debounce: Send, Sync);
static_assertions::assert_impl_all!(KeyedDebouncer<String>: Send, Sync);

/// Debounce `callback` under `key` with the process-wide keyed debouncer.
pub fn debounce<K, F>(key: K, callback: F) -> Result<()>
where
    K: Key,
    F: FnOnce() + Send + 'static,
{
    KeyedDebouncer::<K>::global().run(key, callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_config_defaults() {
        let config = DebounceConfig::default();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert!(!config.call_regular);
        assert_eq!(config.idle_ticks_before_pause, NO_RESPONSE_TIMES);
    }

    #[test]
    fn test_immediate_after_interval() {
        let clock = Arc::new(ManualClock::new());
        let debounce = Debounce::builder()
            .interval(Duration::from_secs(60))
            .clock(clock.clone())
            .build();

        clock.advance(Duration::from_secs(61));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        debounce
            .run(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debounce.has_pending());
        assert_eq!(debounce.invocation_count(), 1);
    }

    #[test]
    fn test_deferred_within_interval() {
        let clock = Arc::new(ManualClock::new());
        let debounce = Debounce::builder()
            .interval(Duration::from_secs(60))
            .clock(clock.clone())
            .build();

        clock.advance(Duration::from_secs(10));
        debounce.run(|| {}).unwrap();

        assert!(debounce.has_pending());
        assert_eq!(debounce.invocation_count(), 0);
        assert!(debounce.is_timer_running());
    }

    #[test]
    fn test_latest_callback_wins() {
        let debounce = Debounce::builder()
            .interval(Duration::from_millis(50))
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            debounce.run(move || seen.lock().push(i)).unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn test_run_after_dispose() {
        let debounce = Debounce::new(DebounceConfig::with_interval(Duration::from_millis(20)));
        debounce.run(|| {}).unwrap();
        debounce.dispose();

        assert!(debounce.is_disposed());
        assert!(!debounce.is_timer_running());
        let err = debounce.run(|| {}).unwrap_err();
        assert!(matches!(err, SyncError::ObjectDisposed { object: "Debounce" }));
    }

    #[test]
    fn test_timer_pauses_when_idle() {
        let debounce = Debounce::builder()
            .interval(Duration::from_millis(10))
            .idle_ticks_before_pause(3)
            .build();

        debounce.run(|| {}).unwrap();
        assert!(debounce.is_timer_running());

        assert!(wait_until(Duration::from_secs(2), || !debounce.is_timer_running()));
        assert_eq!(debounce.invocation_count(), 1);

        debounce.run(|| {}).unwrap();
        assert!(debounce.is_timer_running());
    }

    #[test]
    fn test_timer_survives_panicking_callback() {
        let debounce = Debounce::builder()
            .interval(Duration::from_millis(20))
            .build();

        debounce.run(|| panic!("callback failed")).unwrap();
        assert!(wait_until(Duration::from_secs(2), || debounce.invocation_count() == 1));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        thread::sleep(Duration::from_millis(5));
        debounce
            .run(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_debounced_delivers_latest_argument() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let debounced = Debounced::new(
            DebounceConfig::with_interval(Duration::from_millis(40)),
            move |value: u32| sink.lock().push(value),
        );

        for value in [1, 2, 3] {
            debounced.call(value).unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_keyed_instances_are_independent() {
        let keyed = KeyedDebouncer::<&'static str>::new(DebounceConfig::with_interval(
            Duration::from_millis(30),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for key in ["left", "right"] {
            let seen = seen.clone();
            keyed.run(key, move || seen.lock().push(key)).unwrap();
        }
        assert_eq!(keyed.len(), 2);

        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["left", "right"]);

        assert!(keyed.dispose(&"left"));
        assert!(!keyed.contains(&"left"));
        assert!(!keyed.dispose(&"left"));
    }

    #[test]
    fn test_keyed_absent_key() {
        let keyed = KeyedDebouncer::<String>::default();
        let err = keyed.run("  ".to_string(), || {}).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument { .. }));
        assert!(keyed.is_empty());
    }
}
