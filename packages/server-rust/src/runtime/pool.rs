//! Pooled task executor with failure containment.
//!
//! Submissions take one of two paths:
//!
//! 1. **Fast path**: an idle resident worker is claimed and the task is handed
//!    to it over the shared queue. No new tokio task is spawned.
//! 2. **Slow path**: a new worker is spawned. It runs the task, then parks on
//!    the shared queue for more work while the resident count stays at or
//!    below the soft ceiling and the pool has not been told to retire.
//!
//! Submission never blocks and never fails. Every task runs inside a
//! containment boundary: a panic or an `Err` is logged (or handed to a
//! per-call handler), counted, and never takes the worker down.
//!
//! Storage, cache, and logging work bypass the idle pool and are tracked by
//! their own [`TaskCounter`]s so shutdown can drain each category in order.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use super::config::PoolConfig;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Receives a contained failure in place of the default error log.
pub type FailureHandler = Box<dyn FnOnce(FailureReport) + Send>;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a submitted task did not complete normally.
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error("task panicked: {message}")]
    Panicked { message: String },
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
}

impl TaskFailure {
    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }
}

/// A contained failure together with where the task came from.
#[derive(Debug)]
pub struct FailureReport {
    pub task_id: u64,
    /// Source location of the `submit*` call.
    pub origin: &'static Location<'static>,
    pub failure: TaskFailure,
}

// ---------------------------------------------------------------------------
// TaskCounter
// ---------------------------------------------------------------------------

/// Completion counter for one task category.
#[derive(Debug, Clone, Default)]
pub struct TaskCounter {
    count: Arc<AtomicUsize>,
}

impl TaskCounter {
    /// Creates an RAII guard that holds the counter up until dropped.
    ///
    /// Dropping happens during unwinding too, so a panicking task still
    /// releases its count.
    #[must_use]
    pub fn guard(&self) -> TaskGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            count: Arc::clone(&self.count),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Polls until the counter reaches zero.
    ///
    /// Returns `false` if `timeout` elapsed first. `None` waits indefinitely.
    pub async fn wait_for_zero(&self, poll_interval: Duration, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.count() == 0 {
                return true;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Decrements its [`TaskCounter`] on drop.
#[derive(Debug)]
pub struct TaskGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Snapshot of the executor's diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks submitted and not yet finished, across all categories.
    pub live_tasks: usize,
    /// Workers spawned through the slow path that have not exited.
    pub pool_workers: usize,
    /// Resident workers parked on the shared queue.
    pub idle_workers: usize,
    pub storage_tasks: usize,
    pub cache_tasks: usize,
    pub logging_tasks: usize,
    /// Tasks ever submitted; also the last assigned task id.
    pub tasks_started: u64,
    pub failures: u64,
    pub last_failure: Option<SystemTime>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct PoolShared {
    soft_ceiling: usize,
    pool_workers: AtomicUsize,
    idle: AtomicUsize,
    live: TaskCounter,
    next_task_id: AtomicU64,
    failures: AtomicU64,
    last_failure: Mutex<Option<SystemTime>>,
    general: TaskCounter,
    storage: TaskCounter,
    cache: TaskCounter,
    logging: TaskCounter,
    logging_closed: watch::Sender<bool>,
    retire: watch::Sender<bool>,
    queue_tx: mpsc::UnboundedSender<Job>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl PoolShared {
    /// Claims one idle worker, if any.
    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        *self.last_failure.lock() = Some(SystemTime::now());
        metrics::counter!("msgque_task_failures_total").increment(1);
    }

    fn is_retiring(&self) -> bool {
        *self.retire.borrow()
    }
}

/// Cloneable handle to a shared worker pool.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<PoolShared>,
}

impl Executor {
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (retire, _) = watch::channel(false);
        let (logging_closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                soft_ceiling: config.soft_ceiling,
                pool_workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                live: TaskCounter::default(),
                next_task_id: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                last_failure: Mutex::new(None),
                general: TaskCounter::default(),
                storage: TaskCounter::default(),
                cache: TaskCounter::default(),
                logging: TaskCounter::default(),
                logging_closed,
                retire,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
            }),
        }
    }

    /// Runs `task` on the pool.
    #[track_caller]
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = self.contain(
            async move {
                task.await;
                Ok(())
            },
            None,
            Location::caller(),
            self.shared.general.guard(),
        );
        self.dispatch(job);
    }

    /// Runs a fallible task; an `Err` is contained like a panic.
    #[track_caller]
    pub fn submit_fallible<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = self.contain(task, None, Location::caller(), self.shared.general.guard());
        self.dispatch(job);
    }

    /// Runs a fallible task, routing any failure to `handler` instead of the
    /// default log. The failure is still counted.
    #[track_caller]
    pub fn submit_with_handler<F, H>(&self, task: F, handler: H)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        H: FnOnce(FailureReport) + Send + 'static,
    {
        let job = self.contain(
            task,
            Some(Box::new(handler)),
            Location::caller(),
            self.shared.general.guard(),
        );
        self.dispatch(job);
    }

    /// Runs a long-lived task that is handed the retirement signal, which
    /// flips to `true` when shutdown begins.
    #[track_caller]
    pub fn submit_with_stop<F, Fut>(&self, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(task(self.shared.retire.subscribe()));
    }

    /// Runs storage-layer work outside the idle pool, tracked by the storage
    /// counter.
    #[track_caller]
    pub fn submit_storage<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = self.contain(task, None, Location::caller(), self.shared.storage.guard());
        tokio::spawn(job);
    }

    /// Runs cache-layer work outside the idle pool, tracked by the cache
    /// counter.
    #[track_caller]
    pub fn submit_cache<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = self.contain(task, None, Location::caller(), self.shared.cache.guard());
        tokio::spawn(job);
    }

    /// Runs logging work. Returns `false` without running the task once the
    /// logging category has been closed.
    #[track_caller]
    pub fn submit_logging<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shared.logging_closed.borrow() {
            return false;
        }
        let job = self.contain(
            async move {
                task.await;
                Ok(())
            },
            None,
            Location::caller(),
            self.shared.logging.guard(),
        );
        tokio::spawn(job);
        true
    }

    /// Signals idle workers to exit and stops finished workers from going
    /// idle again. Tasks submitted afterwards still run, each on a fresh
    /// worker that exits when done.
    pub fn retire_idle(&self) {
        self.shared.retire.send_replace(true);
    }

    /// Refuses further logging submissions.
    pub fn close_logging(&self) {
        self.shared.logging_closed.send_replace(true);
    }

    #[must_use]
    pub fn is_logging_closed(&self) -> bool {
        *self.shared.logging_closed.borrow()
    }

    /// Subscribes to the logging-closed signal, so drain tasks can flush and
    /// exit.
    #[must_use]
    pub fn logging_closure(&self) -> watch::Receiver<bool> {
        self.shared.logging_closed.subscribe()
    }

    /// Subscribes to the retirement signal.
    #[must_use]
    pub fn retirement(&self) -> watch::Receiver<bool> {
        self.shared.retire.subscribe()
    }

    /// Counter of general (pooled) tasks.
    #[must_use]
    pub fn general(&self) -> &TaskCounter {
        &self.shared.general
    }

    #[must_use]
    pub fn storage(&self) -> &TaskCounter {
        &self.shared.storage
    }

    #[must_use]
    pub fn cache(&self) -> &TaskCounter {
        &self.shared.cache
    }

    #[must_use]
    pub fn logging(&self) -> &TaskCounter {
        &self.shared.logging
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            live_tasks: s.live.count(),
            pool_workers: s.pool_workers.load(Ordering::SeqCst),
            idle_workers: s.idle.load(Ordering::SeqCst),
            storage_tasks: s.storage.count(),
            cache_tasks: s.cache.count(),
            logging_tasks: s.logging.count(),
            tasks_started: s.next_task_id.load(Ordering::SeqCst),
            failures: s.failures.load(Ordering::SeqCst),
            last_failure: *s.last_failure.lock(),
        }
    }

    fn dispatch(&self, job: Job) {
        if self.shared.claim_idle() {
            match self.shared.queue_tx.send(job) {
                Ok(()) => return,
                // The receiver lives in `shared`, so this is unreachable in
                // practice; fall through to a fresh worker.
                Err(mpsc::error::SendError(job)) => self.spawn_worker(job),
            }
        } else {
            self.spawn_worker(job);
        }
    }

    fn spawn_worker(&self, first: Job) {
        let shared = Arc::clone(&self.shared);
        let resident = shared.pool_workers.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("msgque_pool_workers").increment(1.0);
        debug!(pool_workers = resident, "worker spawned");
        tokio::spawn(worker_loop(shared, first));
    }

    fn contain<F>(
        &self,
        task: F,
        handler: Option<FailureHandler>,
        origin: &'static Location<'static>,
        category: TaskGuard,
    ) -> Job
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let task_id = shared.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let live = shared.live.guard();

        Box::pin(async move {
            let _guards = (category, live);
            debug!(task_id, %origin, "task started");

            let failure = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(TaskFailure::Failed(e)),
                Err(payload) => Some(TaskFailure::from_panic(payload.as_ref())),
            };

            if let Some(failure) = failure {
                shared.record_failure();
                let report = FailureReport {
                    task_id,
                    origin,
                    failure,
                };
                match handler {
                    Some(handler) => {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(report))).is_err() {
                            error!(task_id, %origin, "task failure handler panicked");
                        }
                    }
                    None => error!(
                        task_id = report.task_id,
                        origin = %report.origin,
                        error = %report.failure,
                        "task failed"
                    ),
                }
            }

            debug!(task_id, "task finished");
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("soft_ceiling", &self.shared.soft_ceiling)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn worker_loop(shared: Arc<PoolShared>, first: Job) {
    let mut retire = shared.retire.subscribe();
    first.await;

    loop {
        if shared.is_retiring() || shared.pool_workers.load(Ordering::SeqCst) > shared.soft_ceiling
        {
            break;
        }

        shared.idle.fetch_add(1, Ordering::SeqCst);
        let job = tokio::select! {
            job = async { shared.queue_rx.lock().await.recv().await } => job,
            _ = retire.changed() => {
                if shared.claim_idle() {
                    break;
                }
                // A submitter already claimed this worker; honour the claim.
                shared.queue_rx.lock().await.recv().await
            }
        };

        match job {
            Some(job) => job.await,
            None => break,
        }
    }

    let remaining = shared.pool_workers.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::gauge!("msgque_pool_workers").decrement(1.0);
    debug!(pool_workers = remaining, "worker exited");
}
