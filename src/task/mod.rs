//! Batch tasks: one bounded chunk of items sent to the remote in one call.
//!
//! A [`BatchTask`] is a reusable slot in a queue's [`TaskPool`]. Each cycle
//! goes Idle -> Running (on [`assign`](BatchTask::assign)) -> Completed ->
//! Idle. The kind-specific work (which axis, which transfer call, how the
//! response maps back to items) is supplied by a [`BatchKind`]:
//! [`SaveBatch`] or [`LoadBatch`].

pub mod load;
pub mod pool;
pub mod save;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::constants::MAX_REQUEST_AMOUNT;
use crate::error::SyncError;
use crate::events::{Observers, SubscriptionId};
use crate::item::{ScheduleSink, SyncItem};
use crate::transfer::{DataTransfer, RemoteError, TransferRejection};

pub use load::LoadBatch;
pub use pool::TaskPool;
pub use save::SaveBatch;

/// Which axis a task works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Batch save.
    Save,
    /// Batch load.
    Load,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Save => write!(f, "save"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Per-item result of a completed remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Items the remote confirmed.
    pub confirmed: Vec<String>,
    /// Items marked failed.
    pub failed: Vec<String>,
    /// Identifiers in the response that matched no item in the chunk.
    pub unknown: Vec<String>,
}

impl Reconciliation {
    /// `true` if every item was confirmed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// How one task cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The remote answered and every item was confirmed or failed.
    Reconciled(Reconciliation),

    /// The transfer boundary refused the call. `identifiers` are the items
    /// handed back to the queue, in chunk order.
    Rejected {
        /// Why the call was refused.
        reason: TransferRejection,
        /// Items returned to the pending queue.
        identifiers: Vec<String>,
    },

    /// The remote call failed as a whole; `failed` lists every item marked
    /// failed.
    RemoteFailed {
        /// The remote error.
        error: RemoteError,
        /// Items marked failed.
        failed: Vec<String>,
    },

    /// A contract violation stopped the cycle.
    Aborted {
        /// The violation.
        error: SyncError,
        /// State of the chunk when the cycle stopped.
        reconciliation: Reconciliation,
    },
}

/// Completion notice for one task cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Task name, `"{kind}_{id}"`.
    pub task_name: String,
    /// Index of the task in its pool.
    pub task_id: usize,
    /// Save or load.
    pub kind: TaskKind,
    /// How the cycle ended.
    pub outcome: TaskOutcome,
}

/// Kind-specific behaviour of a batch task.
#[async_trait]
pub trait BatchKind: Clone + Send + Sync + 'static {
    /// Per-dispatch parameters (save visibility, load subject).
    type Params: Clone + Default + fmt::Debug + Send + Sync + 'static;

    /// The axis this kind works on.
    const KIND: TaskKind;

    /// Registers `item` with `queue` for this kind's requests.
    fn register(&self, item: &Arc<SyncItem>, queue: Weak<dyn ScheduleSink>);

    /// Marks this kind's axis of `item` failed.
    fn fail(&self, item: &SyncItem);

    /// Runs one cycle over `chunk`: validate, mark, send, reconcile.
    ///
    /// Must leave no chunk item requested unless it reports
    /// [`TaskOutcome::Rejected`] for it.
    async fn execute(
        &self,
        task: &str,
        chunk: &[Arc<SyncItem>],
        params: &Self::Params,
        transfer: &DataTransfer,
    ) -> TaskOutcome;
}

/// Fails with [`SyncError::DuplicateIdentifier`] if two chunk items share an
/// identifier.
pub(crate) fn check_duplicates(task: &str, chunk: &[Arc<SyncItem>]) -> Result<(), SyncError> {
    let mut seen = HashSet::with_capacity(chunk.len());
    for item in chunk {
        if !seen.insert(item.identifier()) {
            return Err(SyncError::DuplicateIdentifier {
                task: task.to_string(),
                identifier: item.identifier().to_string(),
            });
        }
    }
    Ok(())
}

/// Finds the chunk item stored under `identifier`.
pub(crate) fn find_item<'a>(chunk: &'a [Arc<SyncItem>], identifier: &str) -> Option<&'a Arc<SyncItem>> {
    chunk.iter().find(|item| item.identifier() == identifier)
}

pub(crate) fn identifiers(chunk: &[Arc<SyncItem>]) -> Vec<String> {
    chunk.iter().map(|item| item.identifier().to_string()).collect()
}

struct Cycle<P> {
    chunk: Vec<Arc<SyncItem>>,
    params: P,
    completion: Option<oneshot::Sender<TaskReport>>,
}

/// A reusable batch task slot.
pub struct BatchTask<K: BatchKind> {
    id: usize,
    name: String,
    kind: K,
    transfer: Arc<DataTransfer>,
    running: AtomicBool,
    cycle: Mutex<Cycle<K::Params>>,
    observers: Observers<TaskReport>,
}

impl<K: BatchKind> BatchTask<K> {
    /// Creates an idle task with pool index `id`.
    pub fn new(id: usize, kind: K, transfer: Arc<DataTransfer>) -> Self {
        Self {
            id,
            name: format!("{}_{id}", K::KIND),
            kind,
            transfer,
            running: AtomicBool::new(false),
            cycle: Mutex::new(Cycle {
                chunk: Vec::new(),
                params: K::Params::default(),
                completion: None,
            }),
            observers: Observers::new(),
        }
    }

    /// Index of this task in its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Task name, e.g. `save_3`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind this task runs.
    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// `true` from assignment until completion.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Items of the current cycle.
    pub fn chunk(&self) -> Vec<Arc<SyncItem>> {
        self.cycle.lock().chunk.clone()
    }

    /// Subscribes to this task's completion reports.
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

    /// Binds a chunk and its parameters and marks the task running.
    ///
    /// Returns the receiver for this cycle's [`TaskReport`].
    ///
    /// # Errors
    ///
    /// - [`SyncError::TaskSlotBusy`] if the previous cycle has not completed.
    /// - [`SyncError::ChunkTooLarge`] if `chunk` exceeds the remote batch
    ///   limit.
    pub fn assign(
        &self,
        queue: &str,
        chunk: Vec<Arc<SyncItem>>,
        params: K::Params,
    ) -> Result<oneshot::Receiver<TaskReport>, SyncError> {
        if chunk.len() > MAX_REQUEST_AMOUNT {
            return Err(SyncError::ChunkTooLarge {
                task: self.name.clone(),
                size: chunk.len(),
                max: MAX_REQUEST_AMOUNT,
            });
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::TaskSlotBusy {
                queue: queue.to_string(),
                task: self.name.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let mut cycle = self.cycle.lock();
        cycle.chunk = chunk;
        cycle.params = params;
        cycle.completion = Some(tx);
        Ok(rx)
    }

    /// Runs the kind's work for the current cycle without completing it.
    pub(crate) async fn execute(&self) -> TaskReport {
        let (chunk, params) = {
            let cycle = self.cycle.lock();
            (cycle.chunk.clone(), cycle.params.clone())
        };
        tracing::debug!(task = %self.name, items = chunk.len(), ?params, "Task started");

        let outcome = self
            .kind
            .execute(&self.name, &chunk, &params, &self.transfer)
            .await;

        TaskReport {
            task_name: self.name.clone(),
            task_id: self.id,
            kind: K::KIND,
            outcome,
        }
    }

    /// Ends the cycle: notifies observers, sends the report, frees the slot.
    pub(crate) fn complete(&self, report: &TaskReport) {
        self.observers.notify(report);
        let completion = {
            let mut cycle = self.cycle.lock();
            cycle.chunk.clear();
            cycle.completion.take()
        };
        if let Some(tx) = completion {
            // Receiver may be gone.
            let _ = tx.send(report.clone());
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(task = %self.name, "Task completed");
    }
}

impl<K: BatchKind> fmt::Debug for BatchTask<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
