//! Error types for synchronization operations.
//!
//! [`SyncError`] covers caller contract violations, registration problems and
//! payload failures. Remote failures are reported separately as
//! [`RemoteError`](crate::transfer::RemoteError), and "try again later"
//! signals from the transfer boundary are plain
//! [`TransferRejection`](crate::transfer::TransferRejection) values.

use thiserror::Error;

/// Errors raised by items, batch tasks and queues.
///
/// Variants flagged by [`is_contract_violation`](SyncError::is_contract_violation)
/// indicate a caller bug. They abort the operation that detected them and are
/// never retried automatically.
///
/// # Examples
///
/// ```
/// use saveable_sync::SyncError;
///
/// let err = SyncError::DuplicateIdentifier {
///     task: "save_0".to_string(),
///     identifier: "inventory".to_string(),
/// };
/// assert!(err.is_contract_violation());
/// assert!(err.to_string().contains("inventory"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Two items in the same batch share an identifier.
    #[error("duplicate identifier {identifier} in batch {task}")]
    DuplicateIdentifier {
        /// The batch task that detected the duplicate.
        task: String,
        /// The repeated identifier.
        identifier: String,
    },

    /// The remote returned a value for an item that never asked to be loaded.
    #[error("task {task} received a load for {identifier}, which was not requested")]
    LoadNotRequested {
        /// The load task reconciling the response.
        task: String,
        /// The item's identifier.
        identifier: String,
    },

    /// A save was requested while the item has a load outstanding.
    #[error("item {identifier} is loading and cannot be saved")]
    SaveWhileLoading {
        /// The item's identifier.
        identifier: String,
    },

    /// A load was requested while the item has a save outstanding.
    #[error("item {identifier} is saving and cannot be loaded")]
    LoadWhileSaving {
        /// The item's identifier.
        identifier: String,
    },

    /// The next pool slot is still running; the pool is too small for the
    /// number of chunks in flight.
    #[error("queue {queue} tried to reuse task {task}, which is still running")]
    TaskSlotBusy {
        /// The queue that attempted the dispatch.
        queue: String,
        /// The running task's name.
        task: String,
    },

    /// A chunk larger than the remote batch limit reached a task.
    #[error("task {task} holds {size} items, the maximum is {max}")]
    ChunkTooLarge {
        /// The task holding the chunk.
        task: String,
        /// Number of items in the chunk.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The item has no queue registered for the requested operation.
    #[error("item {identifier} has no {operation} queue")]
    Unregistered {
        /// The item's identifier.
        identifier: String,
        /// `"save"` or `"load"`.
        operation: &'static str,
    },

    /// Serializing or applying an item payload failed.
    #[error("payload error for {identifier}: {message}")]
    Payload {
        /// The item's identifier.
        identifier: String,
        /// Description of the failure.
        message: String,
    },

    /// Invalid queue or transfer configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns `true` for errors that indicate a caller bug.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentifier { .. }
                | Self::LoadNotRequested { .. }
                | Self::SaveWhileLoading { .. }
                | Self::LoadWhileSaving { .. }
                | Self::TaskSlotBusy { .. }
                | Self::ChunkTooLarge { .. }
        )
    }

    /// Builds a [`SyncError::Payload`] from any displayable error.
    pub fn payload(identifier: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Payload {
            identifier: identifier.into(),
            message: err.to_string(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
