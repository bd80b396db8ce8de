//! Batched save/load synchronization of application state with a remote
//! key-value store.
//!
//! Application state is split into independently tracked items. Items ask to
//! be saved (or are pulled for loading); queues collect those requests,
//! split them into bounded chunks and hand each chunk to a reusable batch
//! task. Every remote call goes through a single-flight transfer boundary,
//! and each item's outcome is reconciled by identifier when the call
//! returns.
//!
//! # Overview
//!
//! ```text
//! item.request_save() ──> SaveQueue ──drain──> save_N [≤10 items]
//!                                                  │
//!                                           DataTransfer (one call at a time)
//!                                                  │
//!                                              RemoteStore
//! ```
//!
//! Each item has a save axis and a load axis, each `Idle`, `Requested` or
//! `Failed`. A failed axis can be requested again. An item is never saved
//! while a load is outstanding, and vice versa.
//!
//! # Module Organization
//!
//! - [`item`] - Items, their state machines and ready-made saveables
//! - [`queue`] - Pending FIFO, chunking and dispatch
//! - [`task`] - Save and load batch tasks and the task pool
//! - [`transfer`] - The transfer boundary and the remote store contract
//! - [`scheduler`] - Job executors (tokio and manual)
//! - [`context`] - Session-scoped owner of all of the above
//! - [`config`] - TOML and environment configuration
//! - [`error`] - Error types

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod events;
pub mod item;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod transfer;

#[cfg(feature = "logging")]
pub mod logging;

// Re-exports for ergonomic access
pub use config::{BusyPolicy, QueueConfig, SyncConfig, TransferConfig};
pub use constants::*;
pub use context::SyncContext;
pub use error::{Result, SyncError};
pub use events::SubscriptionId;
pub use item::{JsonSaveable, SaveCondition, Saveable, SaveableCollection, SyncItem};
pub use queue::{DrainOutcome, LoadQueue, QueueManager, SaveQueue};
pub use scheduler::{ManualScheduler, TaskScheduler, TokioScheduler};
pub use task::{TaskOutcome, TaskReport};
pub use transfer::{
    DataTransfer, InMemoryRemote, RemoteError, RemoteStore, TransferRejection, Visibility,
};
