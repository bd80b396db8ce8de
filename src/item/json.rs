//! A single serde value stored as JSON.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{SaveHook, Saveable, SyncItem};
use crate::error::SyncError;

/// Saveable holding one value of type `T`, serialized with `serde_json`.
///
/// Once the wrapping [`SyncItem`] is registered with a save queue, every
/// [`set`](Self::set) or [`update`](Self::update) requests a save.
///
/// # Examples
///
/// ```
/// use saveable_sync::item::{JsonSaveable, Saveable};
///
/// let volume = JsonSaveable::new("settings.volume", 7u8);
/// assert_eq!(volume.to_payload().unwrap(), "7");
/// assert!(!volume.set(9).unwrap());
/// assert_eq!(volume.get(), 9);
/// ```
pub struct JsonSaveable<T> {
    identifier: String,
    value: RwLock<T>,
    loaded_at: RwLock<Option<DateTime<Utc>>>,
    hook: SaveHook,
}

impl<T> JsonSaveable<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a saveable with an initial value.
    pub fn new(identifier: impl Into<String>, value: T) -> Self {
        Self {
            identifier: identifier.into(),
            value: RwLock::new(value),
            loaded_at: RwLock::new(None),
            hook: SaveHook::new(),
        }
    }

    /// Wraps the value in a shared [`SyncItem`].
    pub fn into_item(self) -> (Arc<Self>, Arc<SyncItem>) {
        let saveable = Arc::new(self);
        let item = SyncItem::new(Arc::clone(&saveable) as Arc<dyn Saveable>);
        (saveable, item)
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replaces the value and requests a save. Returns whether the save was
    /// scheduled.
    pub fn set(&self, value: T) -> Result<bool, SyncError> {
        *self.value.write() = value;
        self.hook.request_save()
    }

    /// Mutates the value in place and requests a save.
    pub fn update<F>(&self, f: F) -> Result<bool, SyncError>
    where
        F: FnOnce(&mut T),
    {
        f(&mut *self.value.write());
        self.hook.request_save()
    }

    /// Timestamp of the last applied load, if any.
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        *self.loaded_at.read()
    }
}

impl<T> Saveable for JsonSaveable<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn to_payload(&self) -> Result<String, SyncError> {
        serde_json::to_string(&*self.value.read())
            .map_err(|e| SyncError::payload(&self.identifier, e))
    }

    fn apply_payload(&self, payload: &str, updated_at: DateTime<Utc>) -> Result<(), SyncError> {
        let value: T =
            serde_json::from_str(payload).map_err(|e| SyncError::payload(&self.identifier, e))?;
        *self.value.write() = value;
        *self.loaded_at.write() = Some(updated_at);
        Ok(())
    }

    fn on_registered(&self, item: &Arc<SyncItem>) {
        self.hook.bind(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u32,
    }

    #[test]
    fn payload_round_trip_records_timestamp() {
        let profile = JsonSaveable::new(
            "profile",
            Profile {
                name: "ada".to_string(),
                level: 3,
            },
        );
        let payload = profile.to_payload().unwrap();
        assert_eq!(payload, r#"{"name":"ada","level":3}"#);

        let at = Utc::now();
        profile
            .apply_payload(r#"{"name":"grace","level":9}"#, at)
            .unwrap();
        assert_eq!(profile.get().level, 9);
        assert_eq!(profile.loaded_at(), Some(at));
    }

    #[test]
    fn invalid_payload_keeps_current_value() {
        let counter = JsonSaveable::new("counter", 5u32);
        let err = counter.apply_payload("\"five\"", Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::Payload { ref identifier, .. } if identifier == "counter"));
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.loaded_at(), None);
    }

    #[test]
    fn set_without_queue_does_not_schedule() {
        let (counter, item) = JsonSaveable::new("counter", 0u32).into_item();
        assert!(!counter.set(1).unwrap());
        assert!(!counter.update(|v| *v += 1).unwrap());
        assert_eq!(counter.get(), 2);
        assert!(!item.save_requested());
    }
}
