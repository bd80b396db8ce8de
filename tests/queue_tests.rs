//! Queue manager tests: scheduling, chunking, round-robin dispatch,
//! deferral, rejection and reset.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use saveable_sync::config::{BusyPolicy, QueueConfig};
use saveable_sync::item::JsonSaveable;
use saveable_sync::queue::{DrainOutcome, LoadQueue, SaveQueue};
use saveable_sync::scheduler::ManualScheduler;
use saveable_sync::task::{TaskKind, TaskOutcome};
use saveable_sync::transfer::{
    ConnectionFlag, DataTransfer, InMemoryRemote, TransferRejection, Visibility,
};
use saveable_sync::{SyncError, SyncItem};

// ─── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    remote: Arc<InMemoryRemote>,
    flag: Arc<ConnectionFlag>,
    transfer: Arc<DataTransfer>,
    scheduler: Arc<ManualScheduler>,
}

fn harness(policy: BusyPolicy) -> Harness {
    let remote = Arc::new(InMemoryRemote::new());
    let flag = Arc::new(ConnectionFlag::new(true));
    let transfer = Arc::new(
        DataTransfer::new(remote.clone(), flag.clone()).with_busy_policy(policy),
    );
    Harness {
        remote,
        flag,
        transfer,
        scheduler: Arc::new(ManualScheduler::new()),
    }
}

fn save_queue(h: &Harness, chunk: usize, pool: usize, group: Vec<Arc<SyncItem>>) -> Arc<SaveQueue> {
    SaveQueue::builder("saves", h.transfer.clone(), h.scheduler.clone())
        .with_config(QueueConfig::default().with_max_chunk_size(chunk).with_pool_size(pool))
        .with_group(group)
        .build()
        .unwrap()
}

fn items(prefix: &str, n: usize) -> Vec<Arc<SyncItem>> {
    (0..n)
        .map(|i| JsonSaveable::new(format!("{prefix}{i}"), i as u32).into_item().1)
        .collect()
}

fn ids(items: &[Arc<SyncItem>]) -> Vec<String> {
    items.iter().map(|item| item.identifier().to_string()).collect()
}

// ─── Scheduling ─────────────────────────────────────────────────────────────

#[test]
fn scheduling_twice_keeps_one_entry() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 2);
    let queue = save_queue(&h, 3, 4, group.clone());

    assert!(queue.schedule(group[0].clone()));
    assert!(!queue.schedule(group[0].clone()));
    assert!(!queue.schedule(group[0].clone()));
    assert!(queue.schedule(group[1].clone()));

    assert_eq!(queue.pending_identifiers(), vec!["item0", "item1"]);
}

#[test]
fn request_save_goes_to_registered_queue() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 3);
    let queue = save_queue(&h, 3, 4, group.clone());
    queue.init();

    for item in group.iter().rev() {
        assert!(item.request_save().unwrap());
        assert!(!item.request_save().unwrap());
    }
    assert_eq!(queue.pending_identifiers(), vec!["item2", "item1", "item0"]);
}

#[test]
fn build_rejects_out_of_range_config() {
    let h = harness(BusyPolicy::Reject);
    let err = SaveQueue::builder("saves", h.transfer.clone(), h.scheduler.clone())
        .with_config(QueueConfig::default().with_max_chunk_size(0))
        .build()
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(ref message) if message.contains("max_chunk_size")));
}

// ─── Chunking ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn seven_items_split_three_three_one() {
    let h = harness(BusyPolicy::Wait);
    let group = items("item", 7);
    let queue = save_queue(&h, 3, 10, group.clone());

    let outcome = queue.force_all().unwrap();
    assert_eq!(outcome.chunk_sizes(), vec![3, 3, 1]);

    let dispatched: Vec<String> = outcome
        .dispatches()
        .iter()
        .flat_map(|chunk| chunk.identifiers.clone())
        .collect();
    assert_eq!(dispatched, ids(&group));
    let task_ids: Vec<usize> = outcome.dispatches().iter().map(|c| c.task_id).collect();
    assert_eq!(task_ids, vec![0, 1, 2]);
    assert_eq!(queue.pending_len(), 0);

    assert_eq!(h.scheduler.run_pending().await, 3);
    let reports = outcome.wait_all().await;
    assert_eq!(reports.len(), 3);
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, TaskOutcome::Reconciled(ref rec) if rec.is_complete())));
    assert_eq!(h.remote.len(), 7);
}

#[test]
fn six_items_split_evenly_without_empty_chunk() {
    let h = harness(BusyPolicy::Wait);
    let queue = save_queue(&h, 3, 10, items("item", 6));

    let outcome = queue.force_all().unwrap();
    assert_eq!(outcome.chunk_sizes(), vec![3, 3]);
    assert_eq!(h.scheduler.pending(), 2);
}

#[test]
fn empty_queue_drains_idle() {
    let h = harness(BusyPolicy::Reject);
    let queue = save_queue(&h, 3, 2, Vec::new());

    assert!(matches!(queue.drain().unwrap(), DrainOutcome::Idle));
    assert!(matches!(queue.process_group(&[]).unwrap(), DrainOutcome::Idle));
    assert!(!queue.is_initialized());
    assert!(queue.tasks().is_empty());

    assert!(matches!(queue.force_all().unwrap(), DrainOutcome::Idle));
    assert!(queue.is_initialized());
    assert_eq!(queue.tasks().len(), 2);
}

// ─── Round Robin ────────────────────────────────────────────────────────────

#[tokio::test]
async fn pool_slots_are_reused_round_robin() {
    let h = harness(BusyPolicy::Wait);
    let first = items("a", 2);
    let second = items("b", 3);
    let queue = save_queue(&h, 1, 3, Vec::new());

    let outcome = queue.process_group(&first).unwrap();
    let names: Vec<String> = outcome.dispatches().iter().map(|c| c.task_name.clone()).collect();
    assert_eq!(names, vec!["save_0", "save_1"]);
    h.scheduler.run_pending().await;

    let outcome = queue.process_group(&second).unwrap();
    let task_ids: Vec<usize> = outcome.dispatches().iter().map(|c| c.task_id).collect();
    assert_eq!(task_ids, vec![2, 0, 1]);
    assert_eq!(queue.cursor(), Some(2));
    h.scheduler.run_pending().await;
}

#[tokio::test]
async fn exhausted_pool_returns_chunks_already_dispatched() {
    let h = harness(BusyPolicy::Wait);
    let group = items("item", 3);
    let queue = save_queue(&h, 1, 2, group.clone());

    let outcome = queue.force_all().unwrap();
    assert_eq!(
        outcome.error(),
        Some(&SyncError::TaskSlotBusy {
            queue: "saves".to_string(),
            task: "save_0".to_string(),
        })
    );
    let dispatched: Vec<Vec<String>> = outcome
        .dispatches()
        .iter()
        .map(|chunk| chunk.identifiers.clone())
        .collect();
    assert_eq!(dispatched, vec![vec!["item0"], vec!["item1"]]);
    assert_eq!(queue.pending_identifiers(), vec!["item2"]);
    assert_eq!(queue.running_tasks(), 2);

    // Chunks that went out before the busy slot still report back.
    assert_eq!(h.scheduler.run_pending().await, 2);
    let reports = outcome.wait_all().await;
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, TaskOutcome::Reconciled(ref rec) if rec.is_complete())));
    assert_eq!(queue.running_tasks(), 0);

    let outcome = queue.drain().unwrap();
    assert!(matches!(outcome, DrainOutcome::Dispatched(_)));
    assert_eq!(outcome.chunk_sizes(), vec![1]);
    h.scheduler.run_pending().await;
    assert_eq!(h.remote.len(), 3);
}

#[tokio::test]
async fn busy_first_slot_dispatches_nothing() {
    let h = harness(BusyPolicy::Wait);
    let group = items("item", 2);
    let queue = save_queue(&h, 1, 1, group.clone());

    let first = queue.process_group(&group[..1]).unwrap();
    assert_eq!(first.chunk_sizes(), vec![1]);

    let err = queue.process_group(&group[1..]).unwrap_err();
    assert_eq!(
        err,
        SyncError::TaskSlotBusy {
            queue: "saves".to_string(),
            task: "save_0".to_string(),
        }
    );
    assert_eq!(queue.pending_identifiers(), vec!["item1"]);
    assert_eq!(h.scheduler.pending(), 1);

    h.scheduler.run_pending().await;
    assert_eq!(first.wait_all().await.len(), 1);
    assert_eq!(queue.drain().unwrap().chunk_sizes(), vec![1]);
}

#[tokio::test]
async fn task_slots_report_their_own_cycles() {
    let h = harness(BusyPolicy::Wait);
    let queue = save_queue(&h, 1, 2, items("item", 3));
    queue.init();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let slot = queue.tasks()[1].clone();
    let id = slot.subscribe(move |report| sink.lock().push(report.task_name.clone()));

    queue.process_group(&queue.group()[..2]).unwrap();
    h.scheduler.run_pending().await;
    queue.process_group(&queue.group()[2..]).unwrap();
    h.scheduler.run_pending().await;

    assert_eq!(*seen.lock(), vec!["save_1".to_string()]);
    assert!(slot.unsubscribe(id));
}

// ─── Deferral and Rejection ─────────────────────────────────────────────────

#[tokio::test]
async fn busy_boundary_defers_drain() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 3);
    let queue = save_queue(&h, 2, 4, group.clone());
    for item in &group {
        queue.schedule(item.clone());
    }

    let in_flight = h.transfer.load_batch(vec![], None).unwrap();
    let outcome = queue.drain().unwrap();
    assert!(matches!(outcome, DrainOutcome::Deferred(TransferRejection::Busy)));
    assert_eq!(queue.pending_len(), 3);
    assert_eq!(h.scheduler.pending(), 0);

    in_flight.await.unwrap();
    let outcome = queue.drain().unwrap();
    assert_eq!(outcome.chunk_sizes(), vec![2, 1]);
}

#[test]
fn disconnected_boundary_defers_drain() {
    let h = harness(BusyPolicy::Wait);
    let queue = save_queue(&h, 3, 4, items("item", 2));
    h.flag.set_connected(false);

    let outcome = queue.force_all().unwrap();
    assert!(matches!(outcome, DrainOutcome::Deferred(TransferRejection::NotConnected)));
    assert_eq!(queue.pending_len(), 2);

    h.flag.set_connected(true);
    assert_eq!(queue.drain().unwrap().chunk_sizes(), vec![2]);
}

#[tokio::test]
async fn rejected_chunk_returns_to_front_of_queue() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 4);
    let queue = save_queue(&h, 2, 4, group.clone());
    h.remote.pause();

    let outcome = queue.force_all().unwrap();
    assert_eq!(outcome.chunk_sizes(), vec![2, 2]);
    let DrainOutcome::Dispatched(mut chunks) = outcome else {
        panic!("expected dispatch");
    };
    let second = chunks.pop().unwrap();
    let first = chunks.pop().unwrap();

    let scheduler = h.scheduler.clone();
    let runner = tokio::spawn(async move { scheduler.run_pending().await });

    // The first chunk holds the boundary, so the second is refused.
    let rejected = second.wait().await.unwrap();
    assert_eq!(
        rejected.outcome,
        TaskOutcome::Rejected {
            reason: TransferRejection::Busy,
            identifiers: vec!["item2".to_string(), "item3".to_string()],
        }
    );
    assert_eq!(queue.pending_identifiers(), vec!["item2", "item3"]);
    assert!(group[2].save_requested());

    h.remote.resume();
    let saved = first.wait().await.unwrap();
    assert!(matches!(saved.outcome, TaskOutcome::Reconciled(_)));
    runner.await.unwrap();

    let outcome = queue.drain().unwrap();
    assert_eq!(outcome.chunk_sizes(), vec![2]);
    h.scheduler.run_pending().await;
    assert!(group.iter().all(|item| item.is_ready() && !item.save_failed()));
    assert_eq!(h.remote.save_calls(), 2);
}

// ─── Observers ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn completion_observers_see_every_report() {
    let h = harness(BusyPolicy::Wait);
    let queue = save_queue(&h, 2, 4, items("item", 5));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = queue.subscribe(move |report| sink.lock().push((report.kind, report.task_name.clone())));

    queue.force_all().unwrap();
    h.scheduler.run_pending().await;

    assert_eq!(
        *seen.lock(),
        vec![
            (TaskKind::Save, "save_0".to_string()),
            (TaskKind::Save, "save_1".to_string()),
            (TaskKind::Save, "save_2".to_string()),
        ]
    );
    assert!(queue.unsubscribe(id));
    assert!(!queue.unsubscribe(id));
}

// ─── Reset ──────────────────────────────────────────────────────────────────

#[test]
fn reset_clears_pending_and_parameters() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 3);
    let queue = save_queue(&h, 3, 4, group.clone());
    queue.init();
    queue.set_visibility(Visibility::Public);
    for item in &group {
        queue.schedule(item.clone());
    }

    queue.reset();

    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.visibility(), Visibility::Private);
    assert!(!queue.is_initialized());
    assert_eq!(queue.cursor(), None);
}

#[test]
fn load_queue_subject_resets_to_current_subject() {
    let h = harness(BusyPolicy::Reject);
    let queue = LoadQueue::builder("loads", h.transfer.clone(), h.scheduler.clone())
        .build()
        .unwrap();

    queue.set_subject(Some("rival".to_string()));
    assert_eq!(queue.subject().as_deref(), Some("rival"));
    queue.reset();
    assert_eq!(queue.subject(), None);
}

#[tokio::test]
async fn rejection_after_reset_fails_items() {
    let h = harness(BusyPolicy::Reject);
    let group = items("item", 2);
    let queue = save_queue(&h, 1, 4, group.clone());
    h.remote.pause();

    let outcome = queue.force_all().unwrap();
    let DrainOutcome::Dispatched(mut chunks) = outcome else {
        panic!("expected dispatch");
    };
    let second = chunks.pop().unwrap();
    queue.reset();

    let scheduler = h.scheduler.clone();
    let runner = tokio::spawn(async move { scheduler.run_pending().await });
    let report = second.wait().await.unwrap();
    assert!(matches!(report.outcome, TaskOutcome::Rejected { .. }));
    assert_eq!(queue.pending_len(), 0);
    assert!(group[1].save_failed());

    h.remote.resume();
    runner.await.unwrap();
    assert!(!group[0].save_requested());
}
