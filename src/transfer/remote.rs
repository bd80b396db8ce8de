//! Remote store contract.
//!
//! A [`RemoteStore`] is a batch key-value service scoped per subject (the
//! authenticated user, or another user whose public data is being read). It
//! is a dumb store: request/response mapping back to items lives in the batch
//! tasks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who may read a saved value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Readable only by the subject that wrote it.
    #[default]
    Private,
    /// Readable by any subject.
    Public,
}

/// Values returned by a batch load.
///
/// Keys absent from `values` were not found (or not visible) remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedBatch {
    /// Loaded payloads keyed by identifier.
    pub values: BTreeMap<String, String>,

    /// Last write time of each loaded value.
    pub updated_at: BTreeMap<String, DateTime<Utc>>,
}

impl LoadedBatch {
    /// Last write time for `key`, falling back to `now` when the remote did
    /// not report one.
    pub fn updated_at_or_now(&self, key: &str) -> DateTime<Utc> {
        self.updated_at.get(key).copied().unwrap_or_else(Utc::now)
    }
}

/// A failure of a whole batch call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote refused the request.
    #[error("remote rejected the request: {message}")]
    Rejected {
        /// Reason given by the remote.
        message: String,
    },

    /// The remote could not be reached.
    #[error("remote unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// Any other backend failure.
    #[error("remote backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Batch key-value service the transfer boundary talks to.
///
/// Implementations must be `Send + Sync`; calls may arrive from any runtime
/// thread, but the transfer boundary never issues two at once.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Writes every entry for the current subject.
    ///
    /// Returns the entries the remote confirmed. Entries missing from the
    /// result were not persisted.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] when the whole call failed.
    async fn save_batch(
        &self,
        entries: BTreeMap<String, String>,
        visibility: Visibility,
    ) -> Result<BTreeMap<String, String>, RemoteError>;

    /// Reads `keys` for `subject`, or for the current subject when `None`.
    ///
    /// # Errors
    ///
    /// [`RemoteError`] when the whole call failed.
    async fn load_batch(
        &self,
        keys: Vec<String>,
        subject: Option<String>,
    ) -> Result<LoadedBatch, RemoteError>;
}

/// Reports whether the remote may be called at all (network up, session
/// authenticated).
pub trait Connectivity: Send + Sync {
    /// `true` if calls are currently allowed.
    fn is_connected(&self) -> bool;
}

/// A [`Connectivity`] backed by a flag the application flips.
#[derive(Debug, Default)]
pub struct ConnectionFlag {
    connected: AtomicBool,
}

impl ConnectionFlag {
    /// Creates a flag in the given state.
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    /// Updates the flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Connectivity for ConnectionFlag {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
