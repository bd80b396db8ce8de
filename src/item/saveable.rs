//! The [`Saveable`] trait implemented by application state.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::SyncItem;
use crate::error::SyncError;

/// Application state that can be stored under a stable key.
///
/// Implementors hold their own interior mutability; every method takes
/// `&self` because the value is shared with the queues through a
/// [`SyncItem`].
///
/// # Examples
///
/// ```
/// use chrono::{DateTime, Utc};
/// use parking_lot::Mutex;
/// use saveable_sync::item::Saveable;
/// use saveable_sync::SyncError;
///
/// struct Score(Mutex<u32>);
///
/// impl Saveable for Score {
///     fn identifier(&self) -> String {
///         "score".to_string()
///     }
///
///     fn to_payload(&self) -> Result<String, SyncError> {
///         Ok(self.0.lock().to_string())
///     }
///
///     fn apply_payload(&self, payload: &str, _: DateTime<Utc>) -> Result<(), SyncError> {
///         *self.0.lock() = payload.parse().map_err(|e| SyncError::payload("score", e))?;
///         Ok(())
///     }
/// }
///
/// let score = Score(Mutex::new(0));
/// score.apply_payload("42", Utc::now()).unwrap();
/// assert_eq!(score.to_payload().unwrap(), "42");
/// ```
pub trait Saveable: Send + Sync {
    /// The key under which the value is stored. Must not change over the
    /// lifetime of the value.
    fn identifier(&self) -> String;

    /// Serializes the current value.
    fn to_payload(&self) -> Result<String, SyncError>;

    /// Replaces the current value with a loaded payload.
    fn apply_payload(&self, payload: &str, updated_at: DateTime<Utc>) -> Result<(), SyncError>;

    /// Last-chance veto for a save request. Defaults to `true`.
    fn can_save(&self) -> bool {
        true
    }

    /// Called when the wrapping item is registered with a save queue.
    ///
    /// Saveables that request their own saves on mutation keep a weak
    /// reference to `item` here, usually through a [`SaveHook`].
    fn on_registered(&self, item: &Arc<SyncItem>) {
        let _ = item;
    }
}

/// Weak back-reference from a saveable to the item wrapping it.
///
/// Lets a saveable request a save when it changes without creating a
/// reference cycle.
#[derive(Debug, Default)]
pub struct SaveHook {
    item: Mutex<Option<Weak<SyncItem>>>,
}

impl SaveHook {
    /// Creates an unbound hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the hook to `item`, replacing any previous binding.
    pub fn bind(&self, item: &Arc<SyncItem>) {
        *self.item.lock() = Some(Arc::downgrade(item));
    }

    /// `true` if the hook points at a live item.
    pub fn is_bound(&self) -> bool {
        self.item
            .lock()
            .as_ref()
            .is_some_and(|item| item.strong_count() > 0)
    }

    /// Requests a save through the bound item.
    ///
    /// Returns `Ok(false)` when unbound.
    pub fn request_save(&self) -> Result<bool, SyncError> {
        let item = self.item.lock().as_ref().and_then(Weak::upgrade);
        match item {
            Some(item) => item.request_save(),
            None => Ok(false),
        }
    }
}
