//! Limits and defaults shared by the queue, task and transfer layers.

/// Maximum number of entries the remote store accepts in a single batch
/// request. Chunk sizes are clamped to this bound at configuration time.
pub const MAX_REQUEST_AMOUNT: usize = 10;

/// Upper bound on the number of reusable task slots in one queue's pool.
pub const MAX_TASK_POOL: usize = 20;

/// Default chunk size for a queue.
pub const DEFAULT_CHUNK_SIZE: usize = MAX_REQUEST_AMOUNT;

/// Default number of task slots in a queue's pool.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Prefix for environment variable overrides of [`SyncConfig`](crate::config::SyncConfig).
pub const ENV_PREFIX: &str = "SAVESYNC_";

/// Default configuration file looked up by [`SyncConfig::load`](crate::config::SyncConfig::load).
pub const DEFAULT_CONFIG_FILE: &str = ".savesync.toml";
