//! Save batches.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::{check_duplicates, find_item, identifiers, BatchKind, Reconciliation, TaskKind, TaskOutcome};
use crate::error::SyncError;
use crate::item::{ScheduleSink, SyncItem};
use crate::transfer::{DataTransfer, Visibility};

/// Saves a chunk of items with one remote call.
///
/// A repeated identifier aborts the cycle before anything is sent and fails
/// every item's save. An item with a load outstanding, or whose payload
/// cannot be serialized, is failed on its own and left out of the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveBatch;

impl SaveBatch {
    fn abort(task: &str, chunk: &[Arc<SyncItem>], error: SyncError) -> TaskOutcome {
        tracing::error!(task = %task, %error, "Save batch aborted");
        for item in chunk {
            item.fail_save();
        }
        TaskOutcome::Aborted {
            error,
            reconciliation: Reconciliation {
                failed: identifiers(chunk),
                ..Reconciliation::default()
            },
        }
    }
}

#[async_trait]
impl BatchKind for SaveBatch {
    type Params = Visibility;

    const KIND: TaskKind = TaskKind::Save;

    fn register(&self, item: &Arc<SyncItem>, queue: Weak<dyn ScheduleSink>) {
        item.register_save_queue(queue);
    }

    fn fail(&self, item: &SyncItem) {
        item.fail_save();
    }

    async fn execute(
        &self,
        task: &str,
        chunk: &[Arc<SyncItem>],
        visibility: &Visibility,
        transfer: &DataTransfer,
    ) -> TaskOutcome {
        if let Err(error) = check_duplicates(task, chunk) {
            return Self::abort(task, chunk, error);
        }

        let mut reconciliation = Reconciliation::default();
        let mut entries = BTreeMap::new();
        for item in chunk {
            if let Err(error) = item.mark_save_requested() {
                tracing::warn!(task = %task, item = %item.identifier(), %error, "Item left out of save batch");
                item.fail_save();
                reconciliation.failed.push(item.identifier().to_string());
                continue;
            }
            match item.saveable().to_payload() {
                Ok(payload) => {
                    entries.insert(item.identifier().to_string(), payload);
                },
                Err(error) => {
                    tracing::warn!(task = %task, item = %item.identifier(), %error, "Payload serialization failed");
                    item.fail_save();
                    reconciliation.failed.push(item.identifier().to_string());
                },
            }
        }
        if entries.is_empty() {
            return TaskOutcome::Reconciled(reconciliation);
        }

        tracing::info!(task = %task, entries = entries.len(), "Dispatching save batch");
        let pending = match transfer.save_batch(entries, *visibility) {
            Ok(pending) => pending,
            Err(reason) => {
                // Items stay requested; the queue puts them back in front.
                return TaskOutcome::Rejected {
                    reason,
                    identifiers: chunk
                        .iter()
                        .filter(|item| item.save_requested())
                        .map(|item| item.identifier().to_string())
                        .collect(),
                };
            },
        };

        let saved = match pending.await {
            Ok(saved) => saved,
            Err(error) => {
                for item in chunk.iter().filter(|item| item.save_requested()) {
                    item.fail_save();
                    reconciliation.failed.push(item.identifier().to_string());
                }
                return TaskOutcome::RemoteFailed {
                    error,
                    failed: reconciliation.failed,
                };
            },
        };

        for (identifier, value) in &saved {
            match find_item(chunk, identifier) {
                Some(item) => {
                    item.confirm_save(value);
                    reconciliation.confirmed.push(identifier.clone());
                },
                None => {
                    tracing::warn!(task = %task, key = %identifier, "Save confirmed for unknown item");
                    reconciliation.unknown.push(identifier.clone());
                },
            }
        }

        for item in chunk.iter().filter(|item| item.save_requested()) {
            tracing::warn!(task = %task, item = %item.identifier(), "Save not confirmed");
            item.fail_save();
            reconciliation.failed.push(item.identifier().to_string());
        }

        tracing::info!(
            task = %task,
            confirmed = reconciliation.confirmed.len(),
            failed = reconciliation.failed.len(),
            "Save batch reconciled"
        );
        TaskOutcome::Reconciled(reconciliation)
    }
}
