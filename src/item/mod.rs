//! Saveable items and their save/load state machines.
//!
//! A [`SyncItem`] wraps one [`Saveable`] with two independent axes, save and
//! load. Each axis moves `Idle -> Requested -> Idle` on confirmation, or
//! `Requested -> Failed` when the remote did not confirm it. A failed axis
//! stays eligible for a new request.
//!
//! ```text
//! save:  Idle --request_save--> Requested --confirm_save--> Idle
//!                                   \------fail_save-----> Failed --request_save--> Requested
//! load:  Idle --(load task)---> Requested --confirm_load--> Idle
//!                                   \------fail_load-----> Failed
//! ```
//!
//! An item never has both axes requested at once. Requesting a save while a
//! load is outstanding (or the reverse) is a contract violation.

pub mod collection;
pub mod json;
pub mod saveable;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::SyncError;

pub use collection::SaveableCollection;
pub use json::JsonSaveable;
pub use saveable::{SaveHook, Saveable};

/// Entry point a queue exposes to the items registered with it.
pub trait ScheduleSink: Send + Sync {
    /// Name of the queue, used in logs.
    fn queue_name(&self) -> &str;

    /// Enqueues the item. Returns `false` if it was already pending.
    fn schedule(&self, item: Arc<SyncItem>) -> bool;
}

/// Status of one axis, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisStatus {
    /// No operation outstanding and the last one (if any) succeeded.
    Idle,
    /// An operation is scheduled or in flight.
    Requested,
    /// The last operation failed; a new request is allowed.
    Failed,
}

/// Flags for one axis of an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisState {
    requested: bool,
    failed: bool,
}

impl AxisState {
    /// `true` while an operation is scheduled or in flight.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// `true` if the last completed operation failed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Derived status. A requested axis reports `Requested` even if the
    /// previous attempt failed.
    pub fn status(&self) -> AxisStatus {
        if self.requested {
            AxisStatus::Requested
        } else if self.failed {
            AxisStatus::Failed
        } else {
            AxisStatus::Idle
        }
    }

    fn request(&mut self) {
        self.requested = true;
    }

    fn confirm(&mut self) {
        self.requested = false;
        self.failed = false;
    }

    fn fail(&mut self) {
        self.requested = false;
        self.failed = true;
    }

    fn withdraw(&mut self) {
        self.requested = false;
    }
}

#[derive(Debug, Default)]
struct ItemState {
    save: AxisState,
    load: AxisState,
}

/// A named gate that must hold for a save request to be accepted.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use saveable_sync::item::SaveCondition;
///
/// let online = Arc::new(AtomicBool::new(false));
/// let condition = SaveCondition::flag("tutorial_done", Arc::clone(&online));
/// assert!(!condition.holds());
/// online.store(true, Ordering::SeqCst);
/// assert!(condition.holds());
/// ```
#[derive(Clone)]
pub struct SaveCondition {
    name: String,
    check: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl SaveCondition {
    /// Creates a condition from a predicate.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Creates a condition backed by a shared boolean flag.
    pub fn flag(name: impl Into<String>, flag: Arc<AtomicBool>) -> Self {
        Self::new(name, move || flag.load(Ordering::SeqCst))
    }

    /// The condition's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the condition.
    pub fn holds(&self) -> bool {
        (self.check)()
    }
}

impl fmt::Debug for SaveCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One tracked unit of state that can be saved to and loaded from the remote.
///
/// Items are shared as `Arc<SyncItem>` between their owner and the queues.
/// Queue membership is by pointer identity, so two `SyncItem`s wrapping the
/// same identifier are distinct items (and will collide inside a batch).
pub struct SyncItem {
    identifier: String,
    saveable: Arc<dyn Saveable>,
    conditions: Vec<SaveCondition>,
    state: Mutex<ItemState>,
    save_queue: Mutex<Option<Weak<dyn ScheduleSink>>>,
    load_queue: Mutex<Option<Weak<dyn ScheduleSink>>>,
}

impl SyncItem {
    /// Wraps a saveable with no save conditions.
    pub fn new(saveable: Arc<dyn Saveable>) -> Arc<Self> {
        Self::with_conditions(saveable, Vec::new())
    }

    /// Wraps a saveable gated by `conditions`, evaluated in order.
    pub fn with_conditions(saveable: Arc<dyn Saveable>, conditions: Vec<SaveCondition>) -> Arc<Self> {
        Arc::new(Self {
            identifier: saveable.identifier(),
            saveable,
            conditions,
            state: Mutex::new(ItemState::default()),
            save_queue: Mutex::new(None),
            load_queue: Mutex::new(None),
        })
    }

    /// The stable key under which this item is stored remotely.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The wrapped saveable.
    pub fn saveable(&self) -> &Arc<dyn Saveable> {
        &self.saveable
    }

    /// Snapshot of the save axis.
    pub fn save_state(&self) -> AxisState {
        self.state.lock().save
    }

    /// Snapshot of the load axis.
    pub fn load_state(&self) -> AxisState {
        self.state.lock().load
    }

    /// `true` while a save is scheduled or in flight.
    pub fn save_requested(&self) -> bool {
        self.state.lock().save.requested
    }

    /// `true` if the last save failed.
    pub fn save_failed(&self) -> bool {
        self.state.lock().save.failed
    }

    /// `true` while a load is in flight.
    pub fn load_requested(&self) -> bool {
        self.state.lock().load.requested
    }

    /// `true` if the last load failed.
    pub fn load_failed(&self) -> bool {
        self.state.lock().load.failed
    }

    /// `true` when neither a save nor a load is outstanding.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        !state.save.requested && !state.load.requested
    }

    // ---- Registration ----

    /// Registers the queue that receives this item's save requests.
    ///
    /// Replaces any previous save queue and lets the saveable bind itself to
    /// this item through [`Saveable::on_registered`].
    pub fn register_save_queue(self: &Arc<Self>, queue: Weak<dyn ScheduleSink>) {
        let previous = self.save_queue.lock().replace(queue.clone());
        if let (Some(old), Some(new)) = (previous.and_then(|w| w.upgrade()), queue.upgrade()) {
            if old.queue_name() != new.queue_name() {
                tracing::warn!(
                    item = %self.identifier,
                    old = old.queue_name(),
                    new = new.queue_name(),
                    "Overriding save queue"
                );
            }
        }
        self.saveable.on_registered(self);
    }

    /// Registers the queue used by [`schedule_load`](Self::schedule_load).
    pub fn register_load_queue(&self, queue: Weak<dyn ScheduleSink>) {
        *self.load_queue.lock() = Some(queue);
    }

    /// `true` if a live save queue is registered.
    pub fn has_save_queue(&self) -> bool {
        self.save_queue
            .lock()
            .as_ref()
            .is_some_and(|queue| queue.strong_count() > 0)
    }

    // ---- Save axis ----

    /// Requests that this item be saved by its save queue.
    ///
    /// Returns `Ok(false)` without changing state when the request is
    /// dropped: a save is already outstanding, a save condition does not
    /// hold, or [`Saveable::can_save`] refuses.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Unregistered`] if no save queue is registered.
    /// - [`SyncError::SaveWhileLoading`] if a load is outstanding.
    pub fn request_save(self: &Arc<Self>) -> Result<bool, SyncError> {
        if self.save_requested() {
            tracing::debug!(item = %self.identifier, "Save canceled, already saving");
            return Ok(false);
        }
        if let Some(condition) = self.conditions.iter().find(|c| !c.holds()) {
            tracing::debug!(
                item = %self.identifier,
                condition = condition.name(),
                "Save canceled, condition not met"
            );
            return Ok(false);
        }
        if !self.saveable.can_save() {
            tracing::debug!(item = %self.identifier, "Save canceled by saveable");
            return Ok(false);
        }

        let sink = self
            .save_queue
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Unregistered {
                identifier: self.identifier.clone(),
                operation: "save",
            })?;

        {
            let mut state = self.state.lock();
            if state.load.requested {
                tracing::error!(item = %self.identifier, "Save requested while loading");
                return Err(SyncError::SaveWhileLoading {
                    identifier: self.identifier.clone(),
                });
            }
            if state.save.requested {
                return Ok(false);
            }
            state.save.request();
        }

        tracing::debug!(item = %self.identifier, queue = sink.queue_name(), "Save scheduled");
        sink.schedule(Arc::clone(self));
        Ok(true)
    }

    /// Marks the save axis requested on behalf of a save task.
    ///
    /// Idempotent when a save is already requested.
    pub(crate) fn mark_save_requested(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.load.requested {
            return Err(SyncError::SaveWhileLoading {
                identifier: self.identifier.clone(),
            });
        }
        state.save.request();
        Ok(())
    }

    /// Confirms a save. `saved_value` is the value the remote persisted.
    pub fn confirm_save(&self, saved_value: &str) {
        self.state.lock().save.confirm();
        tracing::trace!(item = %self.identifier, value = saved_value, "Save confirmed");
    }

    /// Marks the last save as failed. The item may be saved again.
    pub fn fail_save(&self) {
        self.state.lock().save.fail();
    }

    // ---- Load axis ----

    /// Hands this item to its registered load queue.
    ///
    /// The load axis is marked by the load task when the batch is sent, not
    /// here.
    ///
    /// # Errors
    ///
    /// [`SyncError::Unregistered`] if no load queue is registered.
    pub fn schedule_load(self: &Arc<Self>) -> Result<bool, SyncError> {
        let sink = self
            .load_queue
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Unregistered {
                identifier: self.identifier.clone(),
                operation: "load",
            })?;
        Ok(sink.schedule(Arc::clone(self)))
    }

    /// Marks the load axis requested. Called by the load task for every item
    /// in its chunk before the batch is sent.
    ///
    /// # Errors
    ///
    /// [`SyncError::LoadWhileSaving`] if a save is outstanding.
    pub fn mark_load_requested(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.save.requested {
            return Err(SyncError::LoadWhileSaving {
                identifier: self.identifier.clone(),
            });
        }
        state.load.request();
        Ok(())
    }

    /// Applies a loaded payload and confirms the load.
    ///
    /// # Errors
    ///
    /// [`SyncError::Payload`] if the saveable rejects the payload; the load
    /// axis is then marked failed.
    pub fn confirm_load(&self, payload: &str, updated_at: DateTime<Utc>) -> Result<(), SyncError> {
        match self.saveable.apply_payload(payload, updated_at) {
            Ok(()) => {
                self.state.lock().load.confirm();
                tracing::trace!(item = %self.identifier, %updated_at, "Load confirmed");
                Ok(())
            },
            Err(err) => {
                self.state.lock().load.fail();
                Err(err)
            },
        }
    }

    /// Marks the last load as failed.
    pub fn fail_load(&self) {
        self.state.lock().load.fail();
    }

    /// Clears the load request without marking a failure. Used when the batch
    /// never left the process.
    pub(crate) fn withdraw_load(&self) {
        self.state.lock().load.withdraw();
    }

    // ---- Lifecycle ----

    /// Clears both axes and drops queue registrations.
    pub fn reset(&self) {
        tracing::debug!(item = %self.identifier, "Resetting item");
        *self.state.lock() = ItemState::default();
        *self.save_queue.lock() = None;
        *self.load_queue.lock() = None;
    }
}

impl fmt::Debug for SyncItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncItem")
            .field("identifier", &self.identifier)
            .field("save", &state.save.status())
            .field("load", &state.load.status())
            .finish_non_exhaustive()
    }
}
