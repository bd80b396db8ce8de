//! Executors for batch task jobs.
//!
//! Queues never run remote calls inline. Each dispatched chunk becomes a
//! job handed to a [`TaskScheduler`], which runs it at most once at some later
//! point.

use std::collections::VecDeque;
use std::fmt;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Runs batch task jobs.
pub trait TaskScheduler: Send + Sync {
    /// Accepts a job. The job must be polled to completion at most once.
    fn execute(&self, job: BoxFuture<'static, ()>);
}

/// Spawns jobs onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Spawns onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawns onto the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl TaskScheduler for TokioScheduler {
    fn execute(&self, job: BoxFuture<'static, ()>) {
        self.handle.spawn(job);
    }
}

/// Collects jobs and runs them when asked.
///
/// Used by tests and by hosts that drive the engine from their own loop.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use futures::FutureExt;
/// use saveable_sync::scheduler::{ManualScheduler, TaskScheduler};
///
/// let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// let scheduler = ManualScheduler::new();
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&runs);
/// scheduler.execute(async move { counter.fetch_add(1, Ordering::SeqCst); }.boxed());
///
/// assert_eq!(scheduler.pending(), 1);
/// assert_eq!(runtime.block_on(scheduler.run_pending()), 1);
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// ```
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<VecDeque<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    /// Creates a scheduler with no jobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Runs the oldest job to completion. Returns `false` if there was none.
    pub async fn run_next(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job.await;
                true
            },
            None => false,
        }
    }

    /// Runs every queued job concurrently, including jobs queued while
    /// running, until none remain. Returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<_> = self.jobs.lock().drain(..).collect();
            if batch.is_empty() {
                return ran;
            }
            ran += batch.len();
            join_all(batch).await;
        }
    }
}

impl TaskScheduler for ManualScheduler {
    fn execute(&self, job: BoxFuture<'static, ()>) {
        self.jobs.lock().push_back(job);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn run_pending_includes_jobs_queued_by_jobs() {
        let scheduler = Arc::new(ManualScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_log = Arc::clone(&log);
        let inner_scheduler = Arc::clone(&scheduler);
        scheduler.execute(
            async move {
                inner_log.lock().push("outer");
                let nested_log = Arc::clone(&inner_log);
                inner_scheduler.execute(async move { nested_log.lock().push("nested") }.boxed());
            }
            .boxed(),
        );

        assert_eq!(scheduler.run_pending().await, 2);
        assert_eq!(*log.lock(), vec!["outer", "nested"]);
        assert!(!scheduler.run_next().await);
    }

    #[tokio::test]
    async fn tokio_scheduler_spawns_on_current_runtime() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.execute(
            async move {
                let _ = tx.send(5);
            }
            .boxed(),
        );
        assert_eq!(rx.await.unwrap(), 5);
    }
}
