//! The single-flight transfer boundary.
//!
//! [`DataTransfer`] is the only path from batch tasks to the
//! [`RemoteStore`]. It checks connectivity first, then enforces at most one
//! outstanding remote call across every queue that shares it. The busy guard
//! is a one-permit semaphore; the permit travels inside the returned future
//! and is released when that future completes or is dropped.
//!
//! Under [`BusyPolicy::Reject`] a call arriving while another is in flight
//! is refused with [`TransferRejection::Busy`] and the caller retries later.
//! Under [`BusyPolicy::Wait`] the call is accepted and waits for the permit.

pub mod memory;
pub mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::{BusyPolicy, TransferConfig};
use crate::events::{Observers, SubscriptionId};

pub use memory::InMemoryRemote;
pub use remote::{ConnectionFlag, Connectivity, LoadedBatch, RemoteError, RemoteStore, Visibility};

/// Why the boundary refused a call. Recoverable: retry on a later drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TransferRejection {
    /// The connectivity check failed.
    #[error("remote is not connected")]
    NotConnected,
    /// Another call is in flight.
    #[error("transfer boundary is busy")]
    Busy,
}

/// Which kind of call an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOperation {
    /// A batch save.
    Save,
    /// A batch load.
    Load,
}

/// Emitted after each remote call completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A save call returned; `keys` are the confirmed identifiers.
    Saved {
        /// Confirmed identifiers.
        keys: Vec<String>,
    },
    /// A load call returned; `keys` are the identifiers found.
    Loaded {
        /// Identifiers present in the response.
        keys: Vec<String>,
        /// Subject the data was loaded for.
        subject: Option<String>,
    },
    /// A call failed as a whole.
    Failed {
        /// The failed operation.
        operation: TransferOperation,
        /// The remote error.
        error: RemoteError,
    },
}

/// Result future of an accepted save call.
pub type SaveFuture = BoxFuture<'static, Result<BTreeMap<String, String>, RemoteError>>;

/// Result future of an accepted load call.
pub type LoadFuture = BoxFuture<'static, Result<LoadedBatch, RemoteError>>;

enum Admission {
    Held(OwnedSemaphorePermit),
    Queued(Arc<Semaphore>),
}

impl Admission {
    async fn into_permit(self) -> Result<OwnedSemaphorePermit, RemoteError> {
        match self {
            Self::Held(permit) => Ok(permit),
            Self::Queued(semaphore) => {
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RemoteError::Unavailable {
                        message: "transfer boundary closed".to_string(),
                    })
            },
        }
    }
}

/// Gateway to the remote store shared by the save and load queues.
pub struct DataTransfer {
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    permit: Arc<Semaphore>,
    busy_policy: BusyPolicy,
    observers: Observers<TransferEvent>,
}

impl DataTransfer {
    /// Creates a boundary with the default [`BusyPolicy::Reject`].
    pub fn new(remote: Arc<dyn RemoteStore>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            remote,
            connectivity,
            permit: Arc::new(Semaphore::new(1)),
            busy_policy: BusyPolicy::default(),
            observers: Observers::new(),
        }
    }

    /// Sets the busy policy.
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Applies transfer settings from configuration.
    pub fn with_config(self, config: &TransferConfig) -> Self {
        self.with_busy_policy(config.busy_policy)
    }

    /// The configured busy policy.
    pub fn busy_policy(&self) -> BusyPolicy {
        self.busy_policy
    }

    /// `true` if the connectivity check currently passes.
    pub fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// `true` while a remote call holds the permit.
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Whether a call made now would be accepted.
    ///
    /// Under [`BusyPolicy::Wait`] a busy boundary still reports ready.
    pub fn readiness(&self) -> Result<(), TransferRejection> {
        if !self.is_connected() {
            return Err(TransferRejection::NotConnected);
        }
        if self.busy_policy == BusyPolicy::Reject && self.is_busy() {
            return Err(TransferRejection::Busy);
        }
        Ok(())
    }

    /// Subscribes to [`TransferEvent`]s.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Removes a transfer event subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn admit(&self) -> Result<Admission, TransferRejection> {
        if !self.is_connected() {
            return Err(TransferRejection::NotConnected);
        }
        match self.busy_policy {
            BusyPolicy::Reject => match Arc::clone(&self.permit).try_acquire_owned() {
                Ok(permit) => Ok(Admission::Held(permit)),
                Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                    Err(TransferRejection::Busy)
                },
            },
            BusyPolicy::Wait => Ok(Admission::Queued(Arc::clone(&self.permit))),
        }
    }

    /// Starts a batch save.
    ///
    /// The boundary is marked busy as soon as the call is accepted (under
    /// [`BusyPolicy::Reject`]) and stays busy until the returned future
    /// resolves or is dropped.
    ///
    /// # Errors
    ///
    /// [`TransferRejection`] if the call was not accepted. Nothing is sent.
    pub fn save_batch(
        &self,
        entries: BTreeMap<String, String>,
        visibility: Visibility,
    ) -> Result<SaveFuture, TransferRejection> {
        let admission = self.admit().inspect_err(|reason| {
            tracing::warn!(%reason, entries = entries.len(), "Save batch rejected");
        })?;
        let remote = Arc::clone(&self.remote);
        let observers = self.observers.clone();

        Ok(async move {
            let _permit = admission.into_permit().await?;
            tracing::info!(entries = entries.len(), ?visibility, "Sending save batch");
            let result = remote.save_batch(entries, visibility).await;
            match &result {
                Ok(saved) => observers.notify(&TransferEvent::Saved {
                    keys: saved.keys().cloned().collect(),
                }),
                Err(error) => {
                    tracing::warn!(%error, "Save batch failed");
                    observers.notify(&TransferEvent::Failed {
                        operation: TransferOperation::Save,
                        error: error.clone(),
                    });
                },
            }
            result
        }
        .boxed())
    }

    /// Starts a batch load for `subject` (the current subject when `None`).
    ///
    /// # Errors
    ///
    /// [`TransferRejection`] if the call was not accepted. Nothing is sent.
    pub fn load_batch(
        &self,
        keys: Vec<String>,
        subject: Option<String>,
    ) -> Result<LoadFuture, TransferRejection> {
        let admission = self.admit().inspect_err(|reason| {
            tracing::warn!(%reason, keys = keys.len(), "Load batch rejected");
        })?;
        let remote = Arc::clone(&self.remote);
        let observers = self.observers.clone();

        Ok(async move {
            let _permit = admission.into_permit().await?;
            tracing::info!(keys = keys.len(), subject = ?subject, "Sending load batch");
            let result = remote.load_batch(keys, subject.clone()).await;
            match &result {
                Ok(loaded) => observers.notify(&TransferEvent::Loaded {
                    keys: loaded.values.keys().cloned().collect(),
                    subject,
                }),
                Err(error) => {
                    tracing::warn!(%error, "Load batch failed");
                    observers.notify(&TransferEvent::Failed {
                        operation: TransferOperation::Load,
                        error: error.clone(),
                    });
                },
            }
            result
        }
        .boxed())
    }
}

impl fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTransfer")
            .field("busy_policy", &self.busy_policy)
            .field("connected", &self.is_connected())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn boundary(connected: bool, policy: BusyPolicy) -> (DataTransfer, Arc<ConnectionFlag>) {
        let flag = Arc::new(ConnectionFlag::new(connected));
        let transfer = DataTransfer::new(Arc::new(InMemoryRemote::new()), flag.clone())
            .with_busy_policy(policy);
        (transfer, flag)
    }

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn not_connected_is_checked_before_busy() {
        let (transfer, flag) = boundary(true, BusyPolicy::Reject);
        let held = transfer
            .save_batch(entries(&[("a", "1")]), Visibility::Private)
            .unwrap();
        flag.set_connected(false);

        assert_eq!(
            transfer.load_batch(vec!["a".into()], None).err(),
            Some(TransferRejection::NotConnected)
        );
        assert_eq!(transfer.readiness(), Err(TransferRejection::NotConnected));
        drop(held);
    }

    #[tokio::test]
    async fn busy_until_future_resolves() {
        let (transfer, _flag) = boundary(true, BusyPolicy::Reject);
        let pending = transfer
            .save_batch(entries(&[("a", "1")]), Visibility::Private)
            .unwrap();

        assert!(transfer.is_busy());
        assert_eq!(transfer.readiness(), Err(TransferRejection::Busy));
        assert_eq!(
            transfer.load_batch(vec!["a".into()], None).err(),
            Some(TransferRejection::Busy)
        );

        let saved = pending.await.unwrap();
        assert_eq!(saved, entries(&[("a", "1")]));
        assert!(!transfer.is_busy());
        assert_eq!(transfer.readiness(), Ok(()));
    }

    #[tokio::test]
    async fn dropping_the_future_releases_busy() {
        let (transfer, _flag) = boundary(true, BusyPolicy::Reject);
        let pending = transfer.load_batch(vec!["a".into()], None).unwrap();
        assert!(transfer.is_busy());
        drop(pending);
        assert!(!transfer.is_busy());
    }

    #[tokio::test]
    async fn wait_policy_queues_calls() {
        let (transfer, _flag) = boundary(true, BusyPolicy::Wait);
        let first = transfer
            .save_batch(entries(&[("a", "1")]), Visibility::Private)
            .unwrap();
        let second = transfer
            .save_batch(entries(&[("b", "2")]), Visibility::Private)
            .unwrap();
        assert_eq!(transfer.readiness(), Ok(()));

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().len(), 1);
        assert_eq!(second.unwrap().len(), 1);
        assert!(!transfer.is_busy());
    }

    #[tokio::test]
    async fn events_follow_each_call() {
        let remote = Arc::new(InMemoryRemote::new());
        let transfer = DataTransfer::new(remote.clone(), Arc::new(ConnectionFlag::new(true)));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = transfer.subscribe(move |event| sink.lock().push(event.clone()));

        transfer
            .save_batch(entries(&[("a", "1")]), Visibility::Private)
            .unwrap()
            .await
            .unwrap();
        remote.fail_next(RemoteError::Unavailable {
            message: "offline".to_string(),
        });
        assert!(transfer
            .load_batch(vec!["a".into()], None)
            .unwrap()
            .await
            .is_err());

        assert!(transfer.unsubscribe(id));
        assert_eq!(
            *events.lock(),
            vec![
                TransferEvent::Saved {
                    keys: vec!["a".to_string()]
                },
                TransferEvent::Failed {
                    operation: TransferOperation::Load,
                    error: RemoteError::Unavailable {
                        message: "offline".to_string()
                    },
                },
            ]
        );
    }
}
