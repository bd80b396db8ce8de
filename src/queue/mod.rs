//! Queue managers: pending FIFO, chunking and dispatch.
//!
//! A [`QueueManager`] collects scheduled items in insertion order. Each
//! [`drain`](QueueManager::drain) splits the pending items into chunks of at
//! most `max_chunk_size`, assigns every chunk to the next slot of its
//! round-robin [`TaskPool`] and hands the resulting job to the
//! [`TaskScheduler`]. The queue lock is never held while a job runs or while
//! the scheduler is called.
//!
//! ```text
//! schedule(item) ──> pending [a b c d e f g]
//! drain()        ──> save_0 [a b c]   save_1 [d e f]   save_2 [g]
//! ```
//!
//! The same manager drives saves and loads; [`SaveQueue`] and [`LoadQueue`]
//! fix the [`BatchKind`].

mod builder;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::QueueConfig;
use crate::error::SyncError;
use crate::events::{Observers, SubscriptionId};
use crate::item::{ScheduleSink, SyncItem};
use crate::scheduler::TaskScheduler;
use crate::task::{BatchKind, BatchTask, LoadBatch, SaveBatch, TaskOutcome, TaskPool, TaskReport};
use crate::transfer::{DataTransfer, TransferRejection, Visibility};

pub use builder::QueueBuilder;

/// Queue of batch saves.
pub type SaveQueue = QueueManager<SaveBatch>;

/// Queue of batch loads.
pub type LoadQueue = QueueManager<LoadBatch>;

/// One chunk handed to the scheduler by a drain.
#[derive(Debug)]
pub struct ChunkDispatch {
    /// Name of the task that owns the chunk.
    pub task_name: String,
    /// Pool index of that task.
    pub task_id: usize,
    /// Identifiers in the chunk, in dispatch order.
    pub identifiers: Vec<String>,
    /// Resolves with the task's report once the cycle completes.
    pub completion: oneshot::Receiver<TaskReport>,
}

impl ChunkDispatch {
    /// Waits for the task's report. `None` if the job was dropped without
    /// completing.
    pub async fn wait(self) -> Option<TaskReport> {
        self.completion.await.ok()
    }
}

/// Result of a [`drain`](QueueManager::drain).
#[derive(Debug)]
pub enum DrainOutcome {
    /// Nothing was pending.
    Idle,
    /// The transfer boundary is not ready; pending items are untouched.
    Deferred(TransferRejection),
    /// Chunks were assigned and handed to the scheduler, in order.
    Dispatched(Vec<ChunkDispatch>),
    /// Some chunks were dispatched before a pool slot refused the next one.
    /// Items not yet assigned stay pending.
    Partial {
        /// Chunks handed to the scheduler before the failure, in order.
        dispatched: Vec<ChunkDispatch>,
        /// Why the next chunk could not be assigned.
        error: SyncError,
    },
}

impl DrainOutcome {
    /// The dispatched chunks, empty for [`Idle`](Self::Idle) and
    /// [`Deferred`](Self::Deferred).
    pub fn dispatches(&self) -> &[ChunkDispatch] {
        match self {
            Self::Dispatched(chunks) | Self::Partial { dispatched: chunks, .. } => chunks,
            Self::Idle | Self::Deferred(_) => &[],
        }
    }

    /// The error that stopped a [`Partial`](Self::Partial) drain.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Partial { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Sizes of the dispatched chunks, in order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.dispatches()
            .iter()
            .map(|chunk| chunk.identifiers.len())
            .collect()
    }

    /// Waits for every dispatched chunk and returns the reports in dispatch
    /// order.
    pub async fn wait_all(self) -> Vec<TaskReport> {
        let chunks = match self {
            Self::Dispatched(chunks) | Self::Partial { dispatched: chunks, .. } => chunks,
            Self::Idle | Self::Deferred(_) => return Vec::new(),
        };
        let mut reports = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if let Some(report) = chunk.wait().await {
                reports.push(report);
            }
        }
        reports
    }
}

struct QueueState<K: BatchKind> {
    pending: VecDeque<Arc<SyncItem>>,
    pool: Option<TaskPool<K>>,
    params: K::Params,
    generation: u64,
}

/// Scheduler for one kind of batch operation.
///
/// Built with [`QueueBuilder`]; always shared as `Arc<QueueManager<K>>`
/// because items and in-flight jobs hold weak references back to it.
pub struct QueueManager<K: BatchKind> {
    name: String,
    kind: K,
    config: QueueConfig,
    transfer: Arc<DataTransfer>,
    scheduler: Arc<dyn TaskScheduler>,
    group: Vec<Arc<SyncItem>>,
    state: Mutex<QueueState<K>>,
    default_params: K::Params,
    observers: Observers<TaskReport>,
    self_ref: Weak<QueueManager<K>>,
}

impl<K: BatchKind> QueueManager<K> {
    /// Starts a [`QueueBuilder`] for `kind`.
    pub fn builder_for(
        name: impl Into<String>,
        kind: K,
        transfer: Arc<DataTransfer>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> QueueBuilder<K> {
        QueueBuilder::new(name, kind, transfer, scheduler)
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The items this queue owns.
    pub fn group(&self) -> &[Arc<SyncItem>] {
        &self.group
    }

    /// `true` once the pool exists and the group is registered.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().pool.is_some()
    }

    /// Number of items waiting for a drain.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Identifiers of pending items, front first.
    pub fn pending_identifiers(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|item| item.identifier().to_string())
            .collect()
    }

    /// Pool index the next chunk will be assigned to, once initialized.
    pub fn cursor(&self) -> Option<usize> {
        self.state.lock().pool.as_ref().map(TaskPool::cursor)
    }

    /// The pool's task slots in index order; empty until initialized.
    pub fn tasks(&self) -> Vec<Arc<BatchTask<K>>> {
        self.state
            .lock()
            .pool
            .as_ref()
            .map(|pool| pool.tasks().to_vec())
            .unwrap_or_default()
    }

    /// Number of task slots currently running.
    pub fn running_tasks(&self) -> usize {
        self.state.lock().pool.as_ref().map_or(0, TaskPool::running)
    }

    /// Current dispatch parameters.
    pub fn params(&self) -> K::Params {
        self.state.lock().params.clone()
    }

    /// Replaces the dispatch parameters until the next reset.
    pub fn set_params(&self, params: K::Params) {
        self.state.lock().params = params;
    }

    /// Subscribes to completion reports of this queue's tasks.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TaskReport) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Removes a completion subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn as_sink(&self) -> Weak<dyn ScheduleSink> {
        self.self_ref.clone()
    }

    /// Registers `item` so its requests of this kind come to this queue.
    pub fn register(&self, item: &Arc<SyncItem>) {
        self.kind.register(item, self.as_sink());
    }

    /// Builds the task pool and registers the group. Idempotent.
    pub fn init(&self) {
        {
            let mut state = self.state.lock();
            if state.pool.is_some() {
                return;
            }
            state.pool = Some(TaskPool::new(
                self.config.pool_size,
                self.kind.clone(),
                &self.transfer,
            ));
        }
        for item in &self.group {
            self.register(item);
        }
        tracing::debug!(
            queue = %self.name,
            pool = self.config.pool_size,
            group = self.group.len(),
            "Queue initialized"
        );
    }

    /// Adds `item` to the back of the pending queue.
    ///
    /// Returns `false` if the item is already pending.
    pub fn schedule(&self, item: Arc<SyncItem>) -> bool {
        let mut state = self.state.lock();
        if state.pending.iter().any(|pending| Arc::ptr_eq(pending, &item)) {
            tracing::debug!(queue = %self.name, item = %item.identifier(), "Already scheduled");
            return false;
        }
        tracing::trace!(queue = %self.name, item = %item.identifier(), "Scheduled");
        state.pending.push_back(item);
        true
    }

    /// Schedules every group item and drains.
    pub fn force_all(&self) -> Result<DrainOutcome, SyncError> {
        self.init();
        for item in &self.group {
            self.schedule(Arc::clone(item));
        }
        self.drain()
    }

    /// Schedules `items` and drains. An empty slice does nothing.
    pub fn process_group(&self, items: &[Arc<SyncItem>]) -> Result<DrainOutcome, SyncError> {
        if items.is_empty() {
            return Ok(DrainOutcome::Idle);
        }
        for item in items {
            self.schedule(Arc::clone(item));
        }
        self.drain()
    }

    /// Splits the pending items into chunks and dispatches them.
    ///
    /// Initializes the queue on first use unless nothing is pending. If a
    /// pool slot is still running after some chunks went out, the result is
    /// [`DrainOutcome::Partial`] and the unassigned items stay pending.
    ///
    /// # Errors
    ///
    /// [`SyncError::TaskSlotBusy`] if the first pool slot is still running;
    /// nothing is dispatched.
    pub fn drain(&self) -> Result<DrainOutcome, SyncError> {
        if self.state.lock().pending.is_empty() {
            return Ok(DrainOutcome::Idle);
        }
        self.init();

        let mut jobs = Vec::new();
        let mut dispatches = Vec::new();
        let mut failure = None;
        {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return Ok(DrainOutcome::Idle);
            }
            if let Err(reason) = self.transfer.readiness() {
                tracing::debug!(queue = %self.name, %reason, pending = state.pending.len(), "Drain deferred");
                return Ok(DrainOutcome::Deferred(reason));
            }

            let max = self.config.max_chunk_size;
            let chunks = state.pending.len().div_ceil(max);
            let params = state.params.clone();
            let generation = state.generation;
            tracing::info!(queue = %self.name, pending = state.pending.len(), chunks, "Draining queue");

            for _ in 0..chunks {
                let Some(task) = state.pool.as_ref().map(|pool| Arc::clone(pool.current())) else {
                    break;
                };
                if task.is_running() {
                    let error = SyncError::TaskSlotBusy {
                        queue: self.name.clone(),
                        task: task.name().to_string(),
                    };
                    tracing::error!(queue = %self.name, %error, "Pool exhausted");
                    failure = Some(error);
                    break;
                }

                let take = state.pending.len().min(max);
                let chunk: Vec<Arc<SyncItem>> = state.pending.drain(..take).collect();
                let identifiers: Vec<String> =
                    chunk.iter().map(|item| item.identifier().to_string()).collect();
                let completion = match task.assign(&self.name, chunk, params.clone()) {
                    Ok(completion) => completion,
                    Err(error) => {
                        tracing::error!(queue = %self.name, %error, "Chunk assignment failed");
                        failure = Some(error);
                        break;
                    },
                };

                tracing::debug!(queue = %self.name, task = %task.name(), items = identifiers.len(), "Chunk assigned");
                dispatches.push(ChunkDispatch {
                    task_name: task.name().to_string(),
                    task_id: task.id(),
                    identifiers,
                    completion,
                });
                jobs.push(self.job(task, generation));
                if let Some(pool) = state.pool.as_mut() {
                    pool.advance();
                }
            }
        }

        for job in jobs {
            self.scheduler.execute(job);
        }
        match failure {
            Some(error) if dispatches.is_empty() => Err(error),
            Some(error) => Ok(DrainOutcome::Partial {
                dispatched: dispatches,
                error,
            }),
            None => Ok(DrainOutcome::Dispatched(dispatches)),
        }
    }

    /// Clears pending work and parameters and forgets the pool.
    ///
    /// In-flight tasks finish normally; their rejected items are not
    /// returned to this queue.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        tracing::debug!(queue = %self.name, dropped = state.pending.len(), "Resetting queue");
        state.pending.clear();
        state.pool = None;
        state.params = self.default_params.clone();
        state.generation += 1;
    }

    fn job(&self, task: Arc<BatchTask<K>>, generation: u64) -> BoxFuture<'static, ()> {
        let queue = self.self_ref.clone();
        async move {
            let report = task.execute().await;
            if let TaskOutcome::Rejected { identifiers, reason } = &report.outcome {
                match queue.upgrade() {
                    Some(queue) => queue.requeue(&task.chunk(), identifiers, *reason, generation),
                    None => {
                        for item in task.chunk() {
                            task.kind().fail(&item);
                        }
                    },
                }
            }
            task.complete(&report);
            if let Some(queue) = queue.upgrade() {
                queue.observers.notify(&report);
            }
        }
        .boxed()
    }

    fn requeue(
        &self,
        chunk: &[Arc<SyncItem>],
        identifiers: &[String],
        reason: TransferRejection,
        generation: u64,
    ) {
        let returned = chunk
            .iter()
            .filter(|item| identifiers.iter().any(|id| id == item.identifier()));

        let mut state = self.state.lock();
        if state.generation != generation {
            drop(state);
            tracing::debug!(queue = %self.name, "Queue was reset, failing rejected chunk");
            for item in returned {
                self.kind.fail(item);
            }
            return;
        }

        tracing::warn!(queue = %self.name, %reason, items = identifiers.len(), "Chunk rejected, returning items to queue");
        for item in returned.rev() {
            if !state.pending.iter().any(|pending| Arc::ptr_eq(pending, item)) {
                state.pending.push_front(Arc::clone(item));
            }
        }
    }
}

impl QueueManager<SaveBatch> {
    /// Starts a [`QueueBuilder`] for a save queue.
    pub fn builder(
        name: impl Into<String>,
        transfer: Arc<DataTransfer>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> QueueBuilder<SaveBatch> {
        QueueBuilder::new(name, SaveBatch, transfer, scheduler)
    }

    /// Visibility used for the next dispatched chunks.
    pub fn visibility(&self) -> Visibility {
        self.params()
    }

    /// Sets the visibility of subsequent saves until the next reset.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.set_params(visibility);
    }
}

impl QueueManager<LoadBatch> {
    /// Starts a [`QueueBuilder`] for a load queue.
    pub fn builder(
        name: impl Into<String>,
        transfer: Arc<DataTransfer>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> QueueBuilder<LoadBatch> {
        QueueBuilder::new(name, LoadBatch, transfer, scheduler)
    }

    /// Subject whose data the next chunks load; `None` is the current
    /// subject.
    pub fn subject(&self) -> Option<String> {
        self.params()
    }

    /// Loads another subject's data until the next reset.
    pub fn set_subject(&self, subject: Option<String>) {
        self.set_params(subject);
    }
}

impl<K: BatchKind> ScheduleSink for QueueManager<K> {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, item: Arc<SyncItem>) -> bool {
        QueueManager::schedule(self, item)
    }
}

impl<K: BatchKind> fmt::Debug for QueueManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QueueManager")
            .field("name", &self.name)
            .field("kind", &K::KIND)
            .field("pending", &state.pending.len())
            .field("initialized", &state.pool.is_some())
            .field("params", &state.params)
            .finish_non_exhaustive()
    }
}
