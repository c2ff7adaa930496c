//! Lazy singleton registry.
//!
//! A thread-safe "create on first use, reuse forever" cache keyed by type, or
//! by type plus an explicit name. Each slot has its own initialization lock,
//! so first accesses of unrelated singletons never contend with each other.
//!
//! # Example
//!
//! ```
//! use horizon_lattice_sync::SingletonRegistry;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct IconCache {
//!     entries: Vec<String>,
//! }
//!
//! let registry = SingletonRegistry::new();
//!
//! let first = registry.get_or_create::<IconCache>();
//! let second = registry.get_or_create::<IconCache>();
//! assert!(Arc::ptr_eq(&first, &second));
//! ```
//!
//! # Failure
//!
//! A failing initializer caches nothing. The caller that ran it receives
//! [`SyncError::InitializationFailure`] and a later caller may try again.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, LazyLock, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::error::{BoxError, Result, SyncError};
use crate::logging::targets;

/// Global registry instance.
static GLOBAL_REGISTRY: LazyLock<SingletonRegistry> = LazyLock::new(SingletonRegistry::new);

type SharedValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    type_id: TypeId,
    name: Option<String>,
}

impl SlotKey {
    fn of<T: 'static>(name: Option<&str>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: name.map(str::to_string),
        }
    }
}

/// One lazily initialized value.
struct Slot {
    value: OnceLock<SharedValue>,
    init_lock: Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value
            .get()
            .and_then(|value| value.clone().downcast::<T>().ok())
    }
}

/// A keyed lazy-initialization cache.
///
/// Values are stored as `Arc<T>`; every caller for the same key receives a
/// clone of the same `Arc`.
pub struct SingletonRegistry {
    slots: RwLock<HashMap<SlotKey, Arc<Slot>>>,
}

impl SingletonRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static SingletonRegistry {
        &GLOBAL_REGISTRY
    }

    /// Get the singleton of type `T`, creating it with `T::default()` on first use.
    pub fn get_or_create<T>(&self) -> Arc<T>
    where
        T: Default + Send + Sync + 'static,
    {
        self.get_or_init(T::default)
    }

    /// Get the singleton of type `T`, creating it with `init` on first use.
    ///
    /// `init` runs at most once, even under concurrent first access. If it
    /// panics, nothing is cached and the panic propagates to this caller.
    pub fn get_or_init<T, F>(&self, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        match self.init_slot(SlotKey::of::<T>(None), || Ok::<T, Infallible>(init())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Get the singleton of type `T`, creating it with a fallible `init`.
    ///
    /// On failure nothing is cached and this caller receives
    /// [`SyncError::InitializationFailure`].
    pub fn try_get_or_init<T, E, F>(&self, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        self.init_slot(SlotKey::of::<T>(None), init)
            .map_err(|e| SyncError::initialization(&type_name::<T>(), e))
    }

    /// Get the singleton of type `T` registered under `name`.
    ///
    /// Named singletons are independent of the type-keyed one and of each
    /// other. A blank name fails with [`SyncError::InvalidArgument`].
    pub fn get_or_init_named<T, F>(&self, name: &str, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = Self::named_key::<T>(name)?;
        match self.init_slot(key, || Ok::<T, Infallible>(init())) {
            Ok(value) => Ok(value),
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`get_or_init_named`](Self::get_or_init_named).
    pub fn try_get_or_init_named<T, E, F>(&self, name: &str, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let key = Self::named_key::<T>(name)?;
        self.init_slot(key, init)
            .map_err(|e| SyncError::initialization(&format!("{}[{name}]", type_name::<T>()), e))
    }

    /// Get the type-keyed singleton if it has been initialized.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.lookup(&SlotKey::of::<T>(None))
    }

    /// Get a named singleton if it has been initialized.
    pub fn get_named<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.lookup(&SlotKey::of::<T>(Some(name)))
    }

    /// Check whether the type-keyed singleton has been initialized.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Number of initialized singletons.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.value.get().is_some())
            .count()
    }

    /// Returns `true` if no singleton has been initialized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn named_key<T: 'static>(name: &str) -> Result<SlotKey> {
        if name.trim().is_empty() {
            return Err(SyncError::invalid_argument("singleton name", &name));
        }
        Ok(SlotKey::of::<T>(Some(name)))
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &SlotKey) -> Option<Arc<T>> {
        self.slots.read().get(key).and_then(|slot| slot.get::<T>())
    }

    /// Get or lazily create the slot for `key`. Slots are never removed.
    fn slot(&self, key: SlotKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(&key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Double-checked initialization of a single slot.
    fn init_slot<T, E, F>(&self, key: SlotKey, init: F) -> std::result::Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        if let Some(value) = self.lookup::<T>(&key) {
            tracing::trace!(target: targets::SINGLETON, ty = type_name::<T>(), "cache hit");
            return Ok(value);
        }

        let slot = self.slot(key);
        let _init = slot.init_lock.lock();

        // Another caller may have finished while we waited for the lock.
        if let Some(value) = slot.get::<T>() {
            return Ok(value);
        }

        match init() {
            Ok(value) => {
                let value = Arc::new(value);
                let shared: SharedValue = value.clone();
                // Only the holder of `init_lock` ever sets the cell.
                let _ = slot.value.set(shared);
                tracing::debug!(target: targets::SINGLETON, ty = type_name::<T>(), "singleton initialized");
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(
                    target: targets::SINGLETON,
                    ty = type_name::<T>(),
                    "singleton initializer failed, nothing cached"
                );
                Err(err)
            }
        }
    }
}

impl Default for SingletonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SingletonRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonRegistry")
            .field("initialized", &self.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(SingletonRegistry: Send, Sync);

/// Get the process-wide singleton of type `T`, creating it with `T::default()`.
pub fn get_or_create<T>() -> Arc<T>
where
    T: Default + Send + Sync + 'static,
{
    SingletonRegistry::global().get_or_create::<T>()
}

/// Get the process-wide singleton of type `T`, creating it with `init`.
pub fn get_or_init<T, F>(init: F) -> Arc<T>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> T,
{
    SingletonRegistry::global().get_or_init(init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Settings {
        theme: String,
    }

    #[test]
    fn test_type_keyed_default() {
        let registry = SingletonRegistry::new();
        assert!(!registry.contains::<Settings>());

        let first = registry.get_or_create::<Settings>();
        let second = registry.get_or_create::<Settings>();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.contains::<Settings>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_initializer_runs_once() {
        let registry = SingletonRegistry::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let value = registry.get_or_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Settings {
                    theme: "dark".into(),
                }
            });
            assert_eq!(value.theme, "dark");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_access() {
        let registry = Arc::new(SingletonRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_init(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Settings::default()
                    })
                })
            })
            .collect();

        let values: Vec<Arc<Settings>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn test_failed_initializer_is_not_cached() {
        let registry = SingletonRegistry::new();

        let err = registry
            .try_get_or_init::<Settings, _, _>(|| Err("disk unavailable"))
            .unwrap_err();
        assert!(err.is_initialization_failure());
        assert!(registry.get::<Settings>().is_none());

        let value = registry
            .try_get_or_init(|| Ok::<_, std::io::Error>(Settings { theme: "light".into() }))
            .unwrap();
        assert_eq!(value.theme, "light");
    }

    #[test]
    fn test_panicking_initializer_allows_retry() {
        let registry = SingletonRegistry::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.get_or_init::<Settings, _>(|| panic!("initializer exploded"))
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());

        let value = registry.get_or_create::<Settings>();
        assert_eq!(value.theme, "");
    }

    #[test]
    fn test_named_singletons_are_independent() {
        let registry = SingletonRegistry::new();

        let main = registry
            .get_or_init_named("main", || Settings { theme: "main".into() })
            .unwrap();
        let preview = registry
            .get_or_init_named("preview", || Settings { theme: "preview".into() })
            .unwrap();
        let typed = registry.get_or_create::<Settings>();

        assert_eq!(main.theme, "main");
        assert_eq!(preview.theme, "preview");
        assert_eq!(typed.theme, "");
        assert!(Arc::ptr_eq(&main, &registry.get_named::<Settings>("main").unwrap()));

        // Same name, different type: separate slot.
        let counter = registry.get_or_init_named("main", || 7u32).unwrap();
        assert_eq!(*counter, 7);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_blank_name_is_invalid() {
        let registry = SingletonRegistry::new();
        let err = registry
            .get_or_init_named("  ", Settings::default)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_global_registry() {
        struct GlobalMarker(u8);

        let first = get_or_init(|| GlobalMarker(3));
        let second = get_or_init(|| GlobalMarker(9));
        assert_eq!(second.0, 3);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
