//! In-memory remote store.
//!
//! [`InMemoryRemote`] is a [`RemoteStore`] backed by a `DashMap` keyed by
//! `{subject}:{identifier}`. Writes always go to the current subject. Reads
//! for another subject only see values saved as [`Visibility::Public`].
//!
//! It carries fault injection for tests and local runs: omitted keys (never
//! confirmed, never found), a one-shot forced failure, a pause gate that
//! holds calls in flight, and call counters.
//!
//! # Examples
//!
//! ```
//! use saveable_sync::transfer::{InMemoryRemote, Visibility};
//!
//! let remote = InMemoryRemote::new().with_subject("alice");
//! remote.insert("bob", "avatar", "{\"hat\":true}", Visibility::Public);
//! assert_eq!(remote.get("bob", "avatar").as_deref(), Some("{\"hat\":true}"));
//! assert_eq!(remote.len(), 1);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::remote::{LoadedBatch, RemoteError, RemoteStore, Visibility};

/// Subject used when none is configured.
pub const DEFAULT_SUBJECT: &str = "local";

fn make_key(subject: &str, identifier: &str) -> String {
    format!("{subject}:{identifier}")
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    updated_at: DateTime<Utc>,
    visibility: Visibility,
}

/// Thread-safe in-memory [`RemoteStore`].
#[derive(Debug)]
pub struct InMemoryRemote {
    subject: String,
    data: DashMap<String, StoredValue>,
    omitted: Mutex<HashSet<String>>,
    fail_next: Mutex<Option<RemoteError>>,
    paused: watch::Sender<bool>,
    save_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl InMemoryRemote {
    /// Creates an empty store for [`DEFAULT_SUBJECT`].
    pub fn new() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            data: DashMap::new(),
            omitted: Mutex::new(HashSet::new()),
            fail_next: Mutex::new(None),
            paused: watch::Sender::new(false),
            save_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
        }
    }

    /// Sets the current subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// The current subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Seeds a value directly, bypassing fault injection.
    pub fn insert(&self, subject: &str, identifier: &str, value: &str, visibility: Visibility) {
        self.data.insert(
            make_key(subject, identifier),
            StoredValue {
                value: value.to_string(),
                updated_at: Utc::now(),
                visibility,
            },
        );
    }

    /// Reads a stored value directly.
    pub fn get(&self, subject: &str, identifier: &str) -> Option<String> {
        self.data
            .get(&make_key(subject, identifier))
            .map(|entry| entry.value.clone())
    }

    /// Number of stored values across all subjects.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ---- Fault injection ----

    /// Makes `identifier` disappear: saves of it are not confirmed and loads
    /// never return it.
    pub fn omit(&self, identifier: &str) {
        self.omitted.lock().insert(identifier.to_string());
    }

    /// Reverts [`omit`](Self::omit).
    pub fn restore(&self, identifier: &str) {
        self.omitted.lock().remove(identifier);
    }

    /// Fails the next call (save or load) with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Holds every call until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Releases paused calls.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Number of save calls received.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of load calls received.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), RemoteError> {
        let mut paused = self.paused.subscribe();
        if paused.wait_for(|paused| !*paused).await.is_err() {
            return Err(RemoteError::Unavailable {
                message: "remote shut down".to_string(),
            });
        }
        match self.fail_next.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn is_omitted(&self, identifier: &str) -> bool {
        self.omitted.lock().contains(identifier)
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn save_batch(
        &self,
        entries: BTreeMap<String, String>,
        visibility: Visibility,
    ) -> Result<BTreeMap<String, String>, RemoteError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let now = Utc::now();
        let mut confirmed = BTreeMap::new();
        for (identifier, value) in entries {
            if self.is_omitted(&identifier) {
                tracing::trace!(identifier = %identifier, "Dropping omitted save");
                continue;
            }
            self.data.insert(
                make_key(&self.subject, &identifier),
                StoredValue {
                    value: value.clone(),
                    updated_at: now,
                    visibility,
                },
            );
            confirmed.insert(identifier, value);
        }
        Ok(confirmed)
    }

    async fn load_batch(
        &self,
        keys: Vec<String>,
        subject: Option<String>,
    ) -> Result<LoadedBatch, RemoteError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let subject = subject.unwrap_or_else(|| self.subject.clone());
        let foreign = subject != self.subject;
        let mut loaded = LoadedBatch::default();
        for identifier in keys {
            if self.is_omitted(&identifier) {
                continue;
            }
            let Some(stored) = self.data.get(&make_key(&subject, &identifier)) else {
                continue;
            };
            if foreign && stored.visibility == Visibility::Private {
                continue;
            }
            loaded.values.insert(identifier.clone(), stored.value.clone());
            loaded.updated_at.insert(identifier, stored.updated_at);
        }
        Ok(loaded)
    }
}
