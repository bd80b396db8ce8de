//! Owner of the transfer boundary, scheduler and both queues.
//!
//! A [`SyncContext`] replaces process-wide singletons: the application
//! builds one, keeps it for the lifetime of a session and calls
//! [`reset`](SyncContext::reset) on logout.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use saveable_sync::context::SyncContext;
//! use saveable_sync::item::JsonSaveable;
//! use saveable_sync::scheduler::ManualScheduler;
//! use saveable_sync::transfer::{ConnectionFlag, InMemoryRemote};
//!
//! let (coins, item) = JsonSaveable::new("coins", 10u32).into_item();
//! let context = SyncContext::builder(
//!     Arc::new(InMemoryRemote::new()),
//!     Arc::new(ConnectionFlag::new(true)),
//! )
//! .with_scheduler(Arc::new(ManualScheduler::new()))
//! .with_save_group(vec![item.clone()])
//! .with_load_group(vec![item.clone()])
//! .build()
//! .unwrap();
//!
//! context.init();
//! assert!(coins.set(11).unwrap());
//! assert_eq!(context.save_queue().pending_len(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::item::SyncItem;
use crate::queue::{DrainOutcome, LoadQueue, SaveQueue};
use crate::scheduler::{TaskScheduler, TokioScheduler};
use crate::transfer::{Connectivity, DataTransfer, RemoteStore};

/// Queue names used by a [`SyncContext`].
pub const SAVE_QUEUE_NAME: &str = "save";
/// See [`SAVE_QUEUE_NAME`].
pub const LOAD_QUEUE_NAME: &str = "load";

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    save_group: Vec<Arc<SyncItem>>,
    load_group: Vec<Arc<SyncItem>>,
}

impl SyncContextBuilder {
    /// Sets the configuration (defaults otherwise).
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the job scheduler. Defaults to a [`TokioScheduler`] on the
    /// current runtime.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Items owned by the save queue.
    pub fn with_save_group(mut self, items: Vec<Arc<SyncItem>>) -> Self {
        self.save_group = items;
        self
    }

    /// Items owned by the load queue.
    pub fn with_load_group(mut self, items: Vec<Arc<SyncItem>>) -> Self {
        self.load_group = items;
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if the configuration is invalid or no scheduler
    /// was given outside a tokio runtime.
    pub fn build(self) -> Result<SyncContext, SyncError> {
        self.config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let scheduler: Arc<dyn TaskScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current().ok_or_else(|| {
                SyncError::Config("no scheduler given and no tokio runtime running".to_string())
            })?),
        };
        let transfer = Arc::new(
            DataTransfer::new(self.remote, self.connectivity).with_config(&self.config.transfer),
        );

        let save_queue = SaveQueue::builder(SAVE_QUEUE_NAME, Arc::clone(&transfer), Arc::clone(&scheduler))
            .with_config(self.config.save_queue.clone())
            .with_group(self.save_group)
            .build()?;
        let load_queue = LoadQueue::builder(LOAD_QUEUE_NAME, Arc::clone(&transfer), Arc::clone(&scheduler))
            .with_config(self.config.load_queue.clone())
            .with_group(self.load_group)
            .build()?;

        Ok(SyncContext {
            config: self.config,
            transfer,
            scheduler,
            save_queue,
            load_queue,
        })
    }
}

/// The sync engine of one session.
pub struct SyncContext {
    config: SyncConfig,
    transfer: Arc<DataTransfer>,
    scheduler: Arc<dyn TaskScheduler>,
    save_queue: Arc<SaveQueue>,
    load_queue: Arc<LoadQueue>,
}

impl SyncContext {
    /// Starts a builder for a context talking to `remote`.
    pub fn builder(
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncContextBuilder {
        SyncContextBuilder {
            remote,
            connectivity,
            config: SyncConfig::default(),
            scheduler: None,
            save_group: Vec::new(),
            load_group: Vec::new(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The shared transfer boundary.
    pub fn transfer(&self) -> &Arc<DataTransfer> {
        &self.transfer
    }

    /// The job scheduler.
    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    /// The save queue.
    pub fn save_queue(&self) -> &Arc<SaveQueue> {
        &self.save_queue
    }

    /// The load queue.
    pub fn load_queue(&self) -> &Arc<LoadQueue> {
        &self.load_queue
    }

    /// Registers an item outside the groups with both queues.
    pub fn register(&self, item: &Arc<SyncItem>) {
        self.save_queue.register(item);
        self.load_queue.register(item);
    }

    /// Initializes both queues and registers their groups.
    pub fn init(&self) {
        self.save_queue.init();
        self.load_queue.init();
        tracing::info!(
            save_group = self.save_queue.group().len(),
            load_group = self.load_queue.group().len(),
            "Sync context initialized"
        );
    }

    /// Drains the save queue, then the load queue.
    pub fn drain(&self) -> Result<(DrainOutcome, DrainOutcome), SyncError> {
        let saves = self.save_queue.drain()?;
        let loads = self.load_queue.drain()?;
        Ok((saves, loads))
    }

    /// Schedules and drains every item in the save group.
    pub fn save_all(&self) -> Result<DrainOutcome, SyncError> {
        self.save_queue.force_all()
    }

    /// Schedules and drains every item in the load group.
    pub fn load_all(&self) -> Result<DrainOutcome, SyncError> {
        self.load_queue.force_all()
    }

    /// Drops pending work, resets group items and forgets registrations.
    ///
    /// Remote calls in flight are not cancelled. The next
    /// [`init`](Self::init) or drain registers the groups again.
    pub fn reset(&self) {
        self.save_queue.reset();
        self.load_queue.reset();
        for item in self.save_queue.group().iter().chain(self.load_queue.group()) {
            item.reset();
        }
        tracing::info!("Sync context reset");
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("transfer", &self.transfer)
            .field("save_queue", &self.save_queue)
            .field("load_queue", &self.load_queue)
            .finish_non_exhaustive()
    }
}
