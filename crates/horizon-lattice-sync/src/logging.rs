//! Logging facilities for the coordination primitives.
//!
//! All primitives report through the `tracing` crate. Nothing is printed
//! unless the application installs a subscriber:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("horizon_lattice_sync=debug")
//!         .init();
//! }
//! ```
//!
//! Fast-path hits and timer ticks are logged at `trace`, state transitions at
//! `debug`, and failing user closures at `warn`.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by primitive.
pub mod targets {
    /// Crate-wide target.
    pub const SYNC: &str = "horizon_lattice_sync";
    /// Once-only invocation guard.
    pub const ONCE: &str = "horizon_lattice_sync::once";
    /// Lazy singleton registry.
    pub const SINGLETON: &str = "horizon_lattice_sync::singleton";
    /// Debounce timers.
    pub const DEBOUNCE: &str = "horizon_lattice_sync::debounce";
    /// Throttle state.
    pub const THROTTLE: &str = "horizon_lattice_sync::throttle";
    /// Sequential task queues.
    pub const TASK_QUEUE: &str = "horizon_lattice_sync::task_queue";
    /// Host thread pool.
    pub const THREADPOOL: &str = "horizon_lattice_sync::threadpool";
}

/// Span names used for tracing job and callback execution.
pub mod span_names {
    /// A queued job running on the pool.
    pub const QUEUED_JOB: &str = "horizon_lattice_sync::queued_job";
    /// A debounced callback running on its timer thread.
    pub const DEBOUNCE_TICK: &str = "horizon_lattice_sync::debounce_tick";
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
