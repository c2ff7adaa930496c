//! Once-only invocation guard.
//!
//! [`OnceGuard`] runs the action associated with an identifier exactly once,
//! no matter how many threads race to trigger it, and tells each caller
//! whether it was the one that ran it.
//!
//! ```
//! use horizon_lattice_sync::OnceGuard;
//!
//! let guard = OnceGuard::<&'static str>::new();
//!
//! assert!(guard.call_once("register-fonts", || println!("registering")).unwrap());
//! assert!(!guard.call_once("register-fonts", || unreachable!()).unwrap());
//! ```
//!
//! An identifier is only marked as executed after its action returns `Ok`.
//! If the action fails or panics, the guard stays open and a later call may
//! run it again.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{BoxError, Result, SyncError};
use crate::key::Key;
use crate::logging::targets;
use crate::singleton::SingletonRegistry;

/// Per-identifier state: the executed flag plus the lock that serializes
/// attempts for this identifier only.
#[derive(Debug, Default)]
struct OnceEntry {
    executed: AtomicBool,
    lock: Mutex<()>,
}

/// Keyed idempotent-execution primitive.
pub struct OnceGuard<K: Key> {
    entries: RwLock<HashMap<K, Arc<OnceEntry>>>,
}

impl<K: Key> OnceGuard<K> {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide guard for identifiers of type `K`.
    pub fn global() -> Arc<Self> {
        SingletonRegistry::global().get_or_create::<Self>()
    }

    /// Run `action` if no call for `identifier` has completed successfully yet.
    ///
    /// Returns `Ok(true)` to the single caller whose action ran and succeeded,
    /// `Ok(false)` to everyone else. A failing action is reported as
    /// [`SyncError::InitializationFailure`] to its caller only and leaves the
    /// identifier open for a retry. An absent identifier fails with
    /// [`SyncError::InvalidArgument`] without running the action.
    pub fn ensure_called_once<F, E>(&self, identifier: K, action: F) -> Result<bool>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Into<BoxError>,
    {
        if identifier.is_absent() {
            return Err(SyncError::invalid_argument("identifier", &identifier));
        }

        if self.is_executed(&identifier) {
            tracing::trace!(target: targets::ONCE, key = ?identifier, "already executed");
            return Ok(false);
        }

        let entry = self.entry(&identifier);
        let _attempt = entry.lock.lock();

        if entry.executed.load(Ordering::Acquire) {
            return Ok(false);
        }

        match action() {
            Ok(()) => {
                entry.executed.store(true, Ordering::Release);
                tracing::debug!(target: targets::ONCE, key = ?identifier, "action executed");
                Ok(true)
            }
            Err(err) => {
                let err = SyncError::initialization(&identifier, err);
                tracing::warn!(target: targets::ONCE, key = ?identifier, error = %err, "action failed, guard left open");
                Err(err)
            }
        }
    }

    /// Infallible form of [`ensure_called_once`](Self::ensure_called_once).
    pub fn call_once<F>(&self, identifier: K, action: F) -> Result<bool>
    where
        F: FnOnce(),
    {
        self.ensure_called_once(identifier, || {
            action();
            Ok::<(), Infallible>(())
        })
    }

    /// Check whether the action for `identifier` has completed successfully.
    pub fn is_executed(&self, identifier: &K) -> bool {
        self.entries
            .read()
            .get(identifier)
            .is_some_and(|entry| entry.executed.load(Ordering::Acquire))
    }

    /// Forget `identifier` so its action may run again.
    ///
    /// Returns `true` if an entry existed. Callers already waiting on the
    /// old entry still observe its outcome.
    pub fn remove(&self, identifier: &K) -> bool {
        self.entries.write().remove(identifier).is_some()
    }

    /// Number of identifiers seen so far, executed or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no identifier has been seen.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn entry(&self, identifier: &K) -> Arc<OnceEntry> {
        if let Some(entry) = self.entries.read().get(identifier) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(identifier.clone())
            .or_default()
            .clone()
    }
}

impl<K: Key> Default for OnceGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> std::fmt::Debug for OnceGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceGuard")
            .field("entries", &self.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(OnceGuard<String>: Send, Sync);

/// Run `action` at most once per `identifier` across the whole process.
///
/// See [`OnceGuard::ensure_called_once`].
pub fn ensure_called_once<K, F, E>(identifier: K, action: F) -> Result<bool>
where
    K: Key,
    F: FnOnce() -> std::result::Result<(), E>,
    E: Into<BoxError>,
{
    OnceGuard::<K>::global().ensure_called_once(identifier, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_once() {
        let guard = OnceGuard::<String>::new();
        let calls = AtomicUsize::new(0);

        let first = guard
            .call_once("init".to_string(), || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let second = guard
            .call_once("init".to_string(), || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(guard.is_executed(&"init".to_string()));
    }

    #[test]
    fn test_distinct_identifiers() {
        let guard = OnceGuard::<u32>::new();
        assert!(guard.call_once(1, || {}).unwrap());
        assert!(guard.call_once(2, || {}).unwrap());
        assert!(!guard.call_once(1, || {}).unwrap());
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_tuple_identifiers() {
        let guard = OnceGuard::<(&'static str, u64)>::new();
        assert!(guard.call_once(("open", 1), || {}).unwrap());
        assert!(guard.call_once(("open", 2), || {}).unwrap());
        assert!(!guard.call_once(("open", 1), || {}).unwrap());
    }

    #[test]
    fn test_absent_identifier() {
        let guard = OnceGuard::<Option<u32>>::new();
        let calls = AtomicUsize::new(0);

        let err = guard
            .call_once(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidArgument { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(guard.is_empty());
    }

    #[test]
    fn test_failed_action_can_retry() {
        let guard = OnceGuard::<&'static str>::new();

        let err = guard
            .ensure_called_once("connect", || Err("refused"))
            .unwrap_err();
        assert!(err.is_initialization_failure());
        assert!(!guard.is_executed(&"connect"));

        assert!(guard.ensure_called_once("connect", || Ok::<(), BoxError>(())).unwrap());
        assert!(guard.is_executed(&"connect"));
    }

    #[test]
    fn test_panicking_action_can_retry() {
        let guard = OnceGuard::<&'static str>::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.call_once("load", || panic!("load failed"))
        }));
        assert!(result.is_err());
        assert!(!guard.is_executed(&"load"));

        assert!(guard.call_once("load", || {}).unwrap());
    }

    #[test]
    fn test_remove_reopens() {
        let guard = OnceGuard::<u8>::new();
        assert!(guard.call_once(7, || {}).unwrap());
        assert!(guard.remove(&7));
        assert!(!guard.remove(&7));
        assert!(guard.call_once(7, || {}).unwrap());
    }

    #[test]
    fn test_concurrent_callers() {
        let guard = Arc::new(OnceGuard::<&'static str>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(32));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let guard = guard.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    guard
                        .call_once("shared", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                        })
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_guard() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct StartupStep(&'static str);
        impl Key for StartupStep {}

        assert!(ensure_called_once(StartupStep("fonts"), || Ok::<(), BoxError>(())).unwrap());
        assert!(!ensure_called_once(StartupStep("fonts"), || Ok::<(), BoxError>(())).unwrap());
        assert!(OnceGuard::<StartupStep>::global().is_executed(&StartupStep("fonts")));
    }
}
