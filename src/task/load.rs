//! Load batches.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::{check_duplicates, find_item, identifiers, BatchKind, Reconciliation, TaskKind, TaskOutcome};
use crate::error::SyncError;
use crate::item::{ScheduleSink, SyncItem};
use crate::transfer::DataTransfer;

/// Loads a chunk of items with one remote call.
///
/// The parameter is the subject whose data is read; `None` reads the current
/// subject. Keys missing from the response are the normal "never written"
/// case and end up failed. An item with a save outstanding is left out of the
/// request and its load failed; the rest of the chunk is still loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBatch;

impl LoadBatch {
    fn abort(
        task: &str,
        chunk: &[Arc<SyncItem>],
        error: SyncError,
        mut reconciliation: Reconciliation,
    ) -> TaskOutcome {
        tracing::error!(task = %task, %error, "Load batch aborted");
        for item in chunk {
            let id = item.identifier();
            if reconciliation.confirmed.iter().chain(&reconciliation.failed).any(|seen| seen == id) {
                continue;
            }
            item.fail_load();
            reconciliation.failed.push(item.identifier().to_string());
        }
        TaskOutcome::Aborted {
            error,
            reconciliation,
        }
    }
}

#[async_trait]
impl BatchKind for LoadBatch {
    type Params = Option<String>;

    const KIND: TaskKind = TaskKind::Load;

    fn register(&self, item: &Arc<SyncItem>, queue: Weak<dyn ScheduleSink>) {
        item.register_load_queue(queue);
    }

    fn fail(&self, item: &SyncItem) {
        item.fail_load();
    }

    async fn execute(
        &self,
        task: &str,
        chunk: &[Arc<SyncItem>],
        subject: &Option<String>,
        transfer: &DataTransfer,
    ) -> TaskOutcome {
        if let Err(error) = check_duplicates(task, chunk) {
            return Self::abort(task, chunk, error, Reconciliation::default());
        }

        let mut reconciliation = Reconciliation::default();
        let mut requested = Vec::with_capacity(chunk.len());
        for item in chunk {
            match item.mark_load_requested() {
                Ok(()) => requested.push(Arc::clone(item)),
                Err(error) => {
                    tracing::warn!(task = %task, item = %item.identifier(), %error, "Item left out of load batch");
                    item.fail_load();
                    reconciliation.failed.push(item.identifier().to_string());
                },
            }
        }
        if requested.is_empty() {
            return TaskOutcome::Reconciled(reconciliation);
        }

        tracing::info!(task = %task, keys = requested.len(), subject = ?subject, "Dispatching load batch");
        let pending = match transfer.load_batch(identifiers(&requested), subject.clone()) {
            Ok(pending) => pending,
            Err(reason) => {
                for item in &requested {
                    item.withdraw_load();
                }
                return TaskOutcome::Rejected {
                    reason,
                    identifiers: identifiers(&requested),
                };
            },
        };

        let loaded = match pending.await {
            Ok(loaded) => loaded,
            Err(error) => {
                for item in requested.iter().filter(|item| item.load_requested()) {
                    item.fail_load();
                    reconciliation.failed.push(item.identifier().to_string());
                }
                return TaskOutcome::RemoteFailed {
                    error,
                    failed: reconciliation.failed,
                };
            },
        };

        for (identifier, value) in &loaded.values {
            let Some(item) = find_item(&requested, identifier) else {
                tracing::warn!(task = %task, key = %identifier, "Loaded value for unknown item");
                reconciliation.unknown.push(identifier.clone());
                continue;
            };
            if !item.load_requested() {
                let error = SyncError::LoadNotRequested {
                    task: task.to_string(),
                    identifier: identifier.clone(),
                };
                return Self::abort(task, chunk, error, reconciliation);
            }
            match item.confirm_load(value, loaded.updated_at_or_now(identifier)) {
                Ok(()) => reconciliation.confirmed.push(identifier.clone()),
                Err(error) => {
                    tracing::warn!(task = %task, item = %identifier, %error, "Loaded payload rejected");
                    reconciliation.failed.push(identifier.clone());
                },
            }
        }

        for item in requested.iter().filter(|item| item.load_requested()) {
            tracing::debug!(task = %task, item = %item.identifier(), "No remote value");
            item.fail_load();
            reconciliation.failed.push(item.identifier().to_string());
        }

        tracing::info!(
            task = %task,
            confirmed = reconciliation.confirmed.len(),
            failed = reconciliation.failed.len(),
            "Load batch reconciled"
        );
        TaskOutcome::Reconciled(reconciliation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::JsonSaveable;
    use crate::transfer::{ConnectionFlag, InMemoryRemote, TransferRejection, Visibility};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<InMemoryRemote>, DataTransfer, Arc<ConnectionFlag>) {
        let remote = Arc::new(InMemoryRemote::new());
        let flag = Arc::new(ConnectionFlag::new(true));
        let transfer = DataTransfer::new(remote.clone(), flag.clone());
        (remote, transfer, flag)
    }

    fn item(id: &str) -> (Arc<JsonSaveable<u32>>, Arc<SyncItem>) {
        JsonSaveable::new(id, 0u32).into_item()
    }

    #[tokio::test]
    async fn missing_key_fails_only_that_item() {
        let (remote, transfer, _flag) = setup();
        remote.insert("local", "a", "7", Visibility::Private);
        let (a_value, a) = item("a");
        let (_, b) = item("b");
        let chunk = vec![a, b];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        assert_eq!(
            outcome,
            TaskOutcome::Reconciled(Reconciliation {
                confirmed: vec!["a".to_string()],
                failed: vec!["b".to_string()],
                unknown: vec![],
            })
        );
        assert_eq!(a_value.get(), 7);
        assert!(a_value.loaded_at().is_some());
        assert!(chunk[1].load_failed());
        assert!(!chunk[1].load_requested());
    }

    #[tokio::test]
    async fn bad_payload_fails_that_item() {
        let (remote, transfer, _flag) = setup();
        remote.insert("local", "a", "\"not a number\"", Visibility::Private);
        let (_, a) = item("a");
        let chunk = vec![a];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        let reconciliation = match outcome {
            TaskOutcome::Reconciled(reconciliation) => reconciliation,
            other => panic!("expected reconciliation, got {other:?}"),
        };
        assert_eq!(reconciliation.failed, vec!["a".to_string()]);
        assert!(chunk[0].load_failed());
    }

    #[tokio::test]
    async fn saving_item_is_left_out_of_the_request() {
        let (remote, transfer, _flag) = setup();
        remote.insert("local", "a", "1", Visibility::Private);
        remote.insert("local", "b", "2", Visibility::Private);
        let (a_value, a) = item("a");
        let (b_value, b) = item("b");
        a.mark_save_requested().unwrap();
        let chunk = vec![a, b];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        assert_eq!(
            outcome,
            TaskOutcome::Reconciled(Reconciliation {
                confirmed: vec!["b".to_string()],
                failed: vec!["a".to_string()],
                unknown: vec![],
            })
        );
        assert_eq!(a_value.get(), 0);
        assert!(chunk[0].save_requested());
        assert!(chunk[0].load_failed());
        assert_eq!(b_value.get(), 2);
        assert!(chunk[1].is_ready() && !chunk[1].load_failed());
        assert_eq!(remote.load_calls(), 1);
    }

    #[tokio::test]
    async fn chunk_of_saving_items_sends_nothing() {
        let (remote, transfer, _flag) = setup();
        let (_, a) = item("a");
        a.mark_save_requested().unwrap();
        let chunk = vec![a];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        assert!(matches!(outcome, TaskOutcome::Reconciled(ref r) if r.failed == vec!["a".to_string()]));
        assert_eq!(remote.load_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_identifier_still_aborts() {
        let (remote, transfer, _flag) = setup();
        let chunk = vec![item("a").1, item("a").1];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        assert!(matches!(
            outcome,
            TaskOutcome::Aborted {
                error: SyncError::DuplicateIdentifier { .. },
                ..
            }
        ));
        assert!(chunk.iter().all(|item| item.load_failed()));
        assert_eq!(remote.load_calls(), 0);
    }

    #[tokio::test]
    async fn not_connected_withdraws_load_flags() {
        let (remote, transfer, flag) = setup();
        flag.set_connected(false);
        let (_, a) = item("a");
        let chunk = vec![a];

        let outcome = LoadBatch.execute("load_0", &chunk, &None, &transfer).await;

        assert_eq!(
            outcome,
            TaskOutcome::Rejected {
                reason: TransferRejection::NotConnected,
                identifiers: vec!["a".to_string()],
            }
        );
        assert!(chunk[0].is_ready());
        assert!(!chunk[0].load_failed());
        assert_eq!(remote.load_calls(), 0);
    }

    #[tokio::test]
    async fn loads_public_data_of_another_subject() {
        let (remote, transfer, _flag) = setup();
        remote.insert("rival", "score", "99", Visibility::Public);
        let (score, score_item) = item("score");
        let chunk = vec![score_item];

        let outcome = LoadBatch
            .execute("load_0", &chunk, &Some("rival".to_string()), &transfer)
            .await;

        assert!(matches!(outcome, TaskOutcome::Reconciled(ref r) if r.is_complete()));
        assert_eq!(score.get(), 99);
    }
}
