//! Construction of queue managers.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{QueueManager, QueueState};
use crate::config::QueueConfig;
use crate::error::SyncError;
use crate::events::Observers;
use crate::item::SyncItem;
use crate::scheduler::TaskScheduler;
use crate::task::BatchKind;
use crate::transfer::DataTransfer;

/// Builder for a [`QueueManager`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use saveable_sync::config::QueueConfig;
/// use saveable_sync::queue::SaveQueue;
/// use saveable_sync::scheduler::ManualScheduler;
/// use saveable_sync::transfer::{ConnectionFlag, DataTransfer, InMemoryRemote, Visibility};
///
/// let transfer = Arc::new(DataTransfer::new(
///     Arc::new(InMemoryRemote::new()),
///     Arc::new(ConnectionFlag::new(true)),
/// ));
/// let queue = SaveQueue::builder("profile", transfer, Arc::new(ManualScheduler::new()))
///     .with_config(QueueConfig::default().with_max_chunk_size(5))
///     .with_params(Visibility::Public)
///     .build()
///     .unwrap();
/// assert_eq!(queue.name(), "profile");
/// assert_eq!(queue.visibility(), Visibility::Public);
/// ```
pub struct QueueBuilder<K: BatchKind> {
    name: String,
    kind: K,
    transfer: Arc<DataTransfer>,
    scheduler: Arc<dyn TaskScheduler>,
    config: QueueConfig,
    group: Vec<Arc<SyncItem>>,
    params: K::Params,
}

impl<K: BatchKind> QueueBuilder<K> {
    /// Starts a builder with default configuration and an empty group.
    pub fn new(
        name: impl Into<String>,
        kind: K,
        transfer: Arc<DataTransfer>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            transfer,
            scheduler,
            config: QueueConfig::default(),
            group: Vec::new(),
            params: K::Params::default(),
        }
    }

    /// Sets chunk size and pool size.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the items this queue owns. They are registered on first
    /// initialization and are what [`force_all`](QueueManager::force_all)
    /// schedules.
    pub fn with_group(mut self, group: Vec<Arc<SyncItem>>) -> Self {
        self.group = group;
        self
    }

    /// Sets the parameters restored on every reset.
    pub fn with_params(mut self, params: K::Params) -> Self {
        self.params = params;
        self
    }

    /// Builds the queue.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the queue configuration is out of range.
    pub fn build(self) -> Result<Arc<QueueManager<K>>, SyncError> {
        self.config
            .validate(&self.name)
            .map_err(|e| SyncError::Config(e.to_string()))?;

        Ok(Arc::new_cyclic(|self_ref| QueueManager {
            name: self.name,
            kind: self.kind,
            config: self.config,
            transfer: self.transfer,
            scheduler: self.scheduler,
            group: self.group,
            state: Mutex::new(QueueState {
                pending: Default::default(),
                pool: None,
                params: self.params.clone(),
                generation: 0,
            }),
            default_params: self.params,
            observers: Observers::new(),
            self_ref: self_ref.clone(),
        }))
    }
}
