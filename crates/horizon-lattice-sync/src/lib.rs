//! Coordination primitives for Horizon Lattice.
//!
//! This crate provides the small synchronization building blocks that UI and
//! background code share when several callers race for the same resource:
//!
//! - **OnceGuard**: Run an action exactly once per identifier
//! - **SingletonRegistry**: Lazily create one shared instance per type or name
//! - **Debounce**: Collapse bursts of calls into one invocation of the latest callback
//! - **Throttle**: Enforce a minimum spacing between executions per key
//! - **SequentialTaskQueue**: Run jobs one at a time per key, in submission order
//!
//! Every primitive can be used as an owned instance or through its
//! process-wide instance (`global()` and the free functions re-exported here).
//!
//! # Once Example
//!
//! ```
//! use horizon_lattice_sync::{BoxError, ensure_called_once};
//!
//! let ran = ensure_called_once("load-plugins", || {
//!     println!("loading plugins");
//!     Ok::<(), BoxError>(())
//! })?;
//! assert!(ran);
//!
//! let ran_again = ensure_called_once("load-plugins", || Ok::<(), BoxError>(()))?;
//! assert!(!ran_again);
//! # Ok::<(), horizon_lattice_sync::SyncError>(())
//! ```
//!
//! # Throttle Example
//!
//! ```
//! use std::time::Duration;
//! use horizon_lattice_sync::Throttle;
//!
//! let throttle = Throttle::<&'static str>::new().with_interval(Duration::from_secs(1));
//!
//! assert_eq!(throttle.throttle("redraw", || 1), Some(1));
//! // Too soon: rejected without running.
//! assert_eq!(throttle.throttle("redraw", || 2), None);
//! ```
//!
//! # Task Queue Example
//!
//! ```no_run
//! use horizon_lattice_sync::{BoxError, JobOutcome, enqueue};
//!
//! let first = enqueue("cache.db", |_| Ok::<(), BoxError>(()))?;
//! let second = enqueue("cache.db", move |prior| {
//!     assert_eq!(prior.id(), first.id());
//!     Ok::<(), BoxError>(())
//! })?;
//! assert_eq!(second.wait(), JobOutcome::Succeeded);
//! # Ok::<(), horizon_lattice_sync::SyncError>(())
//! ```
//!
//! # Logging
//!
//! All events are emitted through `tracing` under the targets in
//! [`logging::targets`]. The crate never installs a subscriber.

pub mod clock;
mod debounce;
mod error;
mod key;
pub mod logging;
mod once;
mod singleton;
mod task_queue;
pub mod threadpool;
mod throttle;

pub use clock::{Clock, ManualClock, SystemClock, TimestampMillis};
pub use debounce::{
    DEFAULT_DEBOUNCE_INTERVAL, Debounce, DebounceBuilder, DebounceConfig, Debounced,
    KeyedDebouncer, NO_RESPONSE_TIMES, debounce,
};
pub use error::{BoxError, Result, SyncError};
pub use key::Key;
pub use once::{OnceGuard, ensure_called_once};
pub use singleton::{SingletonRegistry, get_or_create, get_or_init};
pub use task_queue::{JobHandle, JobOutcome, PriorJob, SequentialTaskQueue, enqueue};
pub use threadpool::{ThreadPool, ThreadPoolConfig};
pub use throttle::{
    DEFAULT_THROTTLE_INTERVAL, Throttle, ThrottlePermit, check_and_set_state, is_finished,
    set_finished, throttle,
};
