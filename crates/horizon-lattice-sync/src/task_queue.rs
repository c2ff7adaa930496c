//! Per-key sequential job queue.
//!
//! [`SequentialTaskQueue`] runs jobs submitted under the same key one at a
//! time, in submission order, on a [`ThreadPool`]. Jobs under different keys
//! run in parallel.
//!
//! Each key keeps a handle to its most recently submitted job (initially an
//! already-completed placeholder). [`enqueue`](SequentialTaskQueue::enqueue)
//! swaps that handle for the new job's and hooks the new job onto completion
//! of the previous one, so the submitting thread never waits. The hook fires
//! whatever the previous job's outcome was; a failed or panicked job never
//! stalls the chain.
//!
//! ```no_run
//! use horizon_lattice_sync::{BoxError, SequentialTaskQueue};
//!
//! let queue = SequentialTaskQueue::<String>::new();
//!
//! queue.enqueue("settings.json".to_string(), |_prior| {
//!     // write the first snapshot
//!     Ok::<(), BoxError>(())
//! })?;
//! let last = queue.enqueue("settings.json".to_string(), |prior| {
//!     println!("previous write: {:?}", prior.outcome());
//!     Ok::<(), BoxError>(())
//! })?;
//!
//! last.wait();
//! # Ok::<(), horizon_lattice_sync::SyncError>(())
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{BoxError, Result, SyncError};
use crate::key::Key;
use crate::logging::{panic_message, span_names, targets};
use crate::singleton::SingletonRegistry;
use crate::threadpool::ThreadPool;

/// Global job ID counter. ID 0 is reserved for the initial placeholder.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The placeholder that precedes the first job of every key.
    Initial,
    /// The job returned `Ok`.
    Succeeded,
    /// The job returned an error, rendered with `Display`.
    Failed(String),
    /// The job panicked.
    Panicked(String),
}

impl JobOutcome {
    /// Returns `true` for [`Succeeded`](Self::Succeeded) and
    /// [`Initial`](Self::Initial).
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Initial | Self::Succeeded)
    }
}

/// The completed job that ran right before the current one under the same key.
#[derive(Debug, Clone)]
pub struct PriorJob {
    id: u64,
    outcome: JobOutcome,
}

impl PriorJob {
    /// ID of the prior job, 0 for the initial placeholder.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How the prior job ended.
    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }

    /// Returns `true` if there was no real prior job.
    pub fn is_initial(&self) -> bool {
        self.outcome == JobOutcome::Initial
    }
}

type Continuation = Box<dyn FnOnce(PriorJob) + Send + 'static>;

struct Completion {
    outcome: Option<JobOutcome>,
    continuation: Option<Continuation>,
}

struct JobCell {
    id: u64,
    state: Mutex<Completion>,
    done: Condvar,
}

/// A handle to a queued job.
///
/// Cloning the handle does not clone the job.
#[derive(Clone)]
pub struct JobHandle {
    cell: Arc<JobCell>,
}

impl JobHandle {
    fn new(id: u64, outcome: Option<JobOutcome>) -> Self {
        Self {
            cell: Arc::new(JobCell {
                id,
                state: Mutex::new(Completion {
                    outcome,
                    continuation: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    fn initial() -> Self {
        Self::new(0, Some(JobOutcome::Initial))
    }

    fn pending() -> Self {
        Self::new(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed), None)
    }

    /// Unique ID of this job.
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// Returns `true` once the job has finished, whatever the outcome.
    pub fn is_finished(&self) -> bool {
        self.cell.state.lock().outcome.is_some()
    }

    /// The job's outcome, if it has finished.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.cell.state.lock().outcome.clone()
    }

    /// Block until the job finishes.
    pub fn wait(&self) -> JobOutcome {
        let mut state = self.cell.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.cell.done.wait(&mut state);
        }
    }

    /// Block until the job finishes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.cell.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.cell.done.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    /// Record the outcome, wake waiters and fire the continuation.
    fn complete(&self, outcome: JobOutcome) {
        let continuation = {
            let mut state = self.cell.state.lock();
            state.outcome = Some(outcome.clone());
            self.cell.done.notify_all();
            state.continuation.take()
        };

        if let Some(continuation) = continuation {
            continuation(PriorJob {
                id: self.cell.id,
                outcome,
            });
        }
    }

    /// Run `continuation` when this job completes, or right away if it
    /// already has.
    fn on_complete(&self, continuation: Continuation) {
        let prior = {
            let mut state = self.cell.state.lock();
            match &state.outcome {
                Some(outcome) => PriorJob {
                    id: self.cell.id,
                    outcome: outcome.clone(),
                },
                None => {
                    state.continuation = Some(continuation);
                    return;
                }
            }
        };
        continuation(prior);
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Per-key chain state.
struct KeyChain {
    tail: Mutex<JobHandle>,
    pending: AtomicUsize,
}

impl KeyChain {
    fn new() -> Self {
        Self {
            tail: Mutex::new(JobHandle::initial()),
            pending: AtomicUsize::new(0),
        }
    }
}

/// Runs jobs one at a time per key, in submission order.
pub struct SequentialTaskQueue<K: Key> {
    pool: Arc<ThreadPool>,
    chains: RwLock<HashMap<K, Arc<KeyChain>>>,
}

impl<K: Key> SequentialTaskQueue<K> {
    /// Create a queue that runs jobs on the global thread pool.
    pub fn new() -> Self {
        Self::with_pool(ThreadPool::global())
    }

    /// Create a queue that runs jobs on `pool`.
    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self {
            pool,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide queue for keys of type `K`.
    pub fn global() -> Arc<Self> {
        SingletonRegistry::global().get_or_create::<Self>()
    }

    /// Submit `job` under `key`.
    ///
    /// The job starts after every job previously submitted under `key` has
    /// finished, and receives the outcome of the one right before it. Returns
    /// immediately with a handle to the new job.
    pub fn enqueue<F, E>(&self, key: K, job: F) -> Result<JobHandle>
    where
        F: FnOnce(&PriorJob) -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        if key.is_absent() {
            return Err(SyncError::invalid_argument("queue key", &key));
        }

        let chain = self.chain(&key);
        let handle = JobHandle::pending();
        let continuation = self.continuation(key.clone(), chain.clone(), handle.clone(), job);

        let previous = {
            let mut tail = chain.tail.lock();
            chain.pending.fetch_add(1, Ordering::AcqRel);
            std::mem::replace(&mut *tail, handle.clone())
        };

        tracing::debug!(
            target: targets::TASK_QUEUE,
            key = ?key,
            job = handle.id(),
            after = previous.id(),
            "job enqueued"
        );

        previous.on_complete(continuation);
        Ok(handle)
    }

    /// Submit an async job under `key`.
    ///
    /// Must be called from within a Tokio runtime. The future is driven to
    /// completion on a pool thread through the runtime's handle, with the
    /// same ordering as [`enqueue`](Self::enqueue).
    #[cfg(feature = "tokio")]
    pub fn enqueue_async<F, Fut, E>(&self, key: K, job: F) -> Result<JobHandle>
    where
        F: FnOnce(PriorJob) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxError>,
    {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoAsyncRuntime)?;
        self.enqueue(key, move |prior: &PriorJob| runtime.block_on(job(prior.clone())))
    }

    /// Number of jobs submitted under `key` that have not finished.
    pub fn pending_jobs(&self, key: &K) -> usize {
        self.chains
            .read()
            .get(key)
            .map_or(0, |chain| chain.pending.load(Ordering::Acquire))
    }

    /// Handle to the most recently submitted job under `key`.
    pub fn last_job(&self, key: &K) -> Option<JobHandle> {
        self.chains
            .read()
            .get(key)
            .map(|chain| chain.tail.lock().clone())
    }

    /// Number of keys that have ever received a job.
    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    /// Returns `true` if no job was ever submitted.
    pub fn is_empty(&self) -> bool {
        self.chains.read().is_empty()
    }

    fn chain(&self, key: &K) -> Arc<KeyChain> {
        if let Some(chain) = self.chains.read().get(key) {
            return chain.clone();
        }
        self.chains
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyChain::new()))
            .clone()
    }

    /// Build the hook that schedules `job` on the pool once its predecessor
    /// completes.
    fn continuation<F, E>(
        &self,
        key: K,
        chain: Arc<KeyChain>,
        handle: JobHandle,
        job: F,
    ) -> Continuation
    where
        F: FnOnce(&PriorJob) -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let pool = self.pool.clone();
        Box::new(move |prior: PriorJob| {
            pool.spawn(move || {
                let _span = tracing::debug_span!(
                    target: targets::TASK_QUEUE,
                    span_names::QUEUED_JOB,
                    key = ?key,
                    job = handle.id()
                )
                .entered();

                tracing::trace!(target: targets::TASK_QUEUE, prior = prior.id(), "job started");
                let outcome = run_job(job, &prior);
                match &outcome {
                    JobOutcome::Failed(error) => {
                        tracing::warn!(target: targets::TASK_QUEUE, error = %error, "job failed");
                    }
                    JobOutcome::Panicked(panic) => {
                        tracing::warn!(target: targets::TASK_QUEUE, panic = %panic, "job panicked");
                    }
                    _ => tracing::debug!(target: targets::TASK_QUEUE, "job finished"),
                }

                chain.pending.fetch_sub(1, Ordering::AcqRel);
                handle.complete(outcome);
            });
        })
    }
}

fn run_job<F, E>(job: F, prior: &PriorJob) -> JobOutcome
where
    F: FnOnce(&PriorJob) -> std::result::Result<(), E>,
    E: Into<BoxError>,
{
    match catch_unwind(AssertUnwindSafe(|| job(prior))) {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(error)) => {
            let error: BoxError = error.into();
            JobOutcome::Failed(error.to_string())
        }
        Err(payload) => JobOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

impl<K: Key> Default for SequentialTaskQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> std::fmt::Debug for SequentialTaskQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialTaskQueue")
            .field("keys", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}

static_assertions::assert_impl_all!(JobHandle: Send, Sync);
static_assertions::assert_impl_all!(SequentialTaskQueue<String>: Send, Sync);

/// Submit `job` under `key` on the process-wide queue.
pub fn enqueue<K, F, E>(key: K, job: F) -> Result<JobHandle>
where
    K: Key,
    F: FnOnce(&PriorJob) -> std::result::Result<(), E> + Send + 'static,
    E: Into<BoxError>,
{
    SequentialTaskQueue::<K>::global().enqueue(key, job)
}
