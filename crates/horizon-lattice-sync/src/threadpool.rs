//! Host thread pool for queued jobs.
//!
//! A thin wrapper over a rayon pool. [`SequentialTaskQueue`](crate::SequentialTaskQueue)
//! schedules each job here once its predecessor under the same key has
//! completed, so the pool itself never needs to know about keys or ordering.
//!
//! # Example
//!
//! ```no_run
//! use horizon_lattice_sync::threadpool::{ThreadPool, ThreadPoolConfig};
//!
//! // Size the global pool before anything else touches it.
//! ThreadPool::init_global(ThreadPoolConfig::with_threads(4))?;
//!
//! ThreadPool::global().spawn(|| {
//!     println!("running on a worker thread");
//! });
//! # Ok::<(), horizon_lattice_sync::SyncError>(())
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use rayon::{ThreadPool as RayonThreadPool, ThreadPoolBuilder};

use crate::error::{Result, SyncError};
use crate::logging::targets;

/// Global thread pool instance.
static GLOBAL_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

/// Configuration for creating a thread pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads. `None` means use the number of CPU cores.
    pub num_threads: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name: String,
    /// Stack size for worker threads in bytes.
    pub stack_size: Option<usize>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name: "horizon-sync".to_string(),
            stack_size: None,
        }
    }
}

impl ThreadPoolConfig {
    /// Create a new configuration with custom thread count.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..Default::default()
        }
    }

    /// Set the thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// A pool of worker threads that runs arbitrary closures asynchronously.
pub struct ThreadPool {
    pool: RayonThreadPool,
    active_tasks: Arc<AtomicUsize>,
}

impl ThreadPool {
    /// Get the global thread pool instance.
    ///
    /// The global pool is lazily initialized with default settings
    /// (number of threads = number of CPU cores).
    pub fn global() -> Arc<ThreadPool> {
        GLOBAL_POOL
            .get_or_init(|| {
                Arc::new(
                    ThreadPool::new(ThreadPoolConfig::default())
                        .expect("Failed to create global thread pool"),
                )
            })
            .clone()
    }

    /// Initialize the global thread pool with custom configuration.
    ///
    /// Must be called before anything uses [`ThreadPool::global`].
    /// Returns an error if the pool has already been initialized.
    pub fn init_global(config: ThreadPoolConfig) -> Result<Arc<ThreadPool>> {
        let pool = Arc::new(ThreadPool::new(config)?);
        GLOBAL_POOL
            .set(pool.clone())
            .map_err(|_| SyncError::ThreadPool("global pool already initialized".into()))?;
        Ok(pool)
    }

    /// Create a new thread pool with the given configuration.
    pub fn new(config: ThreadPoolConfig) -> Result<Self> {
        let thread_name = config.thread_name.clone();
        // rayon aborts on an unhandled panic in a spawned job.
        let mut builder = ThreadPoolBuilder::new()
            .thread_name(move |index| format!("{thread_name}-{index}"))
            .panic_handler(|payload| {
                tracing::warn!(
                    target: targets::THREADPOOL,
                    panic = %crate::logging::panic_message(payload.as_ref()),
                    "pool task panicked"
                );
            });

        if let Some(num_threads) = config.num_threads {
            builder = builder.num_threads(num_threads);
        }

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool = builder
            .build()
            .map_err(|e| SyncError::ThreadPool(e.to_string()))?;

        tracing::debug!(
            target: targets::THREADPOOL,
            threads = pool.current_num_threads(),
            name = %config.thread_name,
            "thread pool created"
        );

        Ok(Self {
            pool,
            active_tasks: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get the number of threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Get the number of submitted tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Run a closure on the pool without waiting for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        let active_tasks = self.active_tasks.clone();

        self.pool.spawn(move || {
            // Decrement even if the task unwinds.
            let _active = ActiveTaskGuard(active_tasks);
            task();
        });
    }
}

struct ActiveTaskGuard(Arc<AtomicUsize>);

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

static_assertions::assert_impl_all!(ThreadPool: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[test]
    fn test_spawn_runs_task() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2)).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.spawn(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(42));
    }

    #[test]
    fn test_multiple_tasks() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let (tx, rx) = crossbeam_channel::unbounded();

        for _ in 0..10 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }

        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_thread_names() {
        let pool =
            ThreadPool::new(ThreadPoolConfig::with_threads(1).thread_name("queue-test")).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.spawn(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("queue-test-0"));
    }

    #[test]
    fn test_active_tasks_count() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2)).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let b = barrier.clone();

        pool.spawn(move || {
            b.wait();
        });

        // Blocked at the barrier, so still counted.
        assert_eq!(pool.active_tasks(), 1);
        barrier.wait();

        for _ in 0..100 {
            if pool.active_tasks() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.active_tasks(), 0);
    }

    #[test]
    fn test_global_pool() {
        let pool = ThreadPool::global();
        assert!(pool.num_threads() >= 1);
        assert!(Arc::ptr_eq(&pool, &ThreadPool::global()));
    }
}
