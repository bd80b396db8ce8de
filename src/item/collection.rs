//! Keyed, ordered collection stored as a single payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{SaveHook, Saveable, SyncItem};
use crate::error::SyncError;

#[derive(Serialize, Deserialize)]
struct CollectionPayload<V> {
    entries: Vec<V>,
}

/// A collection of values keyed by a function of the value.
///
/// Insertion order is preserved. Every [`insert`](Self::insert) and
/// [`remove`](Self::remove) requests a save once the wrapping item is
/// registered with a save queue. The payload is `{"entries":[...]}`.
///
/// # Examples
///
/// ```
/// use saveable_sync::item::{Saveable, SaveableCollection};
///
/// let names = SaveableCollection::new("names", |name: &String| name.to_lowercase());
/// names.insert("Ada".to_string()).unwrap();
/// names.insert("ADA".to_string()).unwrap();
/// names.insert("Grace".to_string()).unwrap();
///
/// assert_eq!(names.len(), 2);
/// assert_eq!(names.to_payload().unwrap(), r#"{"entries":["ADA","Grace"]}"#);
/// ```
pub struct SaveableCollection<V> {
    identifier: String,
    key_of: fn(&V) -> String,
    entries: RwLock<IndexMap<String, V>>,
    loaded_at: RwLock<Option<DateTime<Utc>>>,
    hook: SaveHook,
}

impl<V> SaveableCollection<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates an empty collection keyed by `key_of`.
    pub fn new(identifier: impl Into<String>, key_of: fn(&V) -> String) -> Self {
        Self {
            identifier: identifier.into(),
            key_of,
            entries: RwLock::new(IndexMap::new()),
            loaded_at: RwLock::new(None),
            hook: SaveHook::new(),
        }
    }

    /// Wraps the collection in a shared [`SyncItem`].
    pub fn into_item(self) -> (Arc<Self>, Arc<SyncItem>) {
        let saveable = Arc::new(self);
        let item = SyncItem::new(Arc::clone(&saveable) as Arc<dyn Saveable>);
        (saveable, item)
    }

    /// Inserts or replaces the entry with the same key and requests a save.
    ///
    /// A replaced entry keeps its position.
    pub fn insert(&self, value: V) -> Result<bool, SyncError> {
        let key = (self.key_of)(&value);
        self.entries.write().insert(key, value);
        self.hook.request_save()
    }

    /// Removes the entry under `key`. A save is requested only if something
    /// was removed.
    pub fn remove(&self, key: &str) -> Result<Option<V>, SyncError> {
        let removed = self.entries.write().shift_remove(key);
        if removed.is_some() {
            self.hook.request_save()?;
        }
        Ok(removed)
    }

    /// Returns a copy of the entry under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Returns `true` if an entry exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Copies of all entries in insertion order.
    pub fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// `true` if the collection has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Timestamp of the last applied load, if any.
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        *self.loaded_at.read()
    }
}

impl<V> Saveable for SaveableCollection<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn to_payload(&self) -> Result<String, SyncError> {
        let payload = CollectionPayload {
            entries: self.values(),
        };
        serde_json::to_string(&payload).map_err(|e| SyncError::payload(&self.identifier, e))
    }

    fn apply_payload(&self, payload: &str, updated_at: DateTime<Utc>) -> Result<(), SyncError> {
        let parsed: CollectionPayload<V> =
            serde_json::from_str(payload).map_err(|e| SyncError::payload(&self.identifier, e))?;
        let entries: IndexMap<String, V> = parsed
            .entries
            .into_iter()
            .map(|value| ((self.key_of)(&value), value))
            .collect();
        *self.entries.write() = entries;
        *self.loaded_at.write() = Some(updated_at);
        Ok(())
    }

    fn on_registered(&self, item: &Arc<SyncItem>) {
        self.hook.bind(item);
    }
}
