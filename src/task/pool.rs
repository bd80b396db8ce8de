//! Fixed-size round-robin pool of batch tasks.

use std::sync::Arc;

use super::{BatchKind, BatchTask};
use crate::transfer::DataTransfer;

/// Reusable task slots, handed out in order `0..len` and wrapping around.
#[derive(Debug)]
pub struct TaskPool<K: BatchKind> {
    tasks: Vec<Arc<BatchTask<K>>>,
    cursor: usize,
}

impl<K: BatchKind> TaskPool<K> {
    /// Builds `size` idle tasks. A zero size is raised to one.
    pub fn new(size: usize, kind: K, transfer: &Arc<DataTransfer>) -> Self {
        let tasks = (0..size.max(1))
            .map(|id| Arc::new(BatchTask::new(id, kind.clone(), Arc::clone(transfer))))
            .collect();
        Self { tasks, cursor: 0 }
    }

    /// The slot the next chunk goes to.
    pub fn current(&self) -> &Arc<BatchTask<K>> {
        &self.tasks[self.cursor]
    }

    /// Moves the cursor to the next slot, wrapping at the end.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.tasks.len();
    }

    /// Index of the next slot.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always `false`; a pool has at least one slot.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All slots in index order.
    pub fn tasks(&self) -> &[Arc<BatchTask<K>>] {
        &self.tasks
    }

    /// Number of slots currently running.
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|task| task.is_running()).count()
    }
}
