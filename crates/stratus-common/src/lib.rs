//! Shared building blocks for Stratus crates: the error taxonomy,
//! configuration, backoff helpers, and logging bootstrap.

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;

pub use backoff::{
    Backoff, FOREVER, Transient, deadline_after, retry_transient, saturating_add, sleep_or_cancel,
};
pub use config::{
    BackoffConfig, DictionaryConfig, IndexConfig, LockConfig, QueueConfig, StorageConfig,
    StratusConfig,
};
pub use error::{Result, StratusError};
pub use tokio_util::sync::CancellationToken;

/// Default path separator of the remote store
pub const DEFAULT_SEPARATOR: &str = "/";

/// Suffix of the object holding a dictionary's index
pub const INDEX_OBJECT_SUFFIX: &str = "__index__";

/// Prefix segment under which indexed dictionaries store value blobs
pub const DATA_PREFIX: &str = "__data__";

/// Metric names published by Stratus components
pub mod metric_names {
    pub const LOCK_ACQUIRED: &str = "stratus_lock_acquired_total";
    pub const LOCK_CONTENTION: &str = "stratus_lock_contention_total";
    pub const LOCK_TIMEOUT: &str = "stratus_lock_timeout_total";
    pub const QUEUE_POPPED: &str = "stratus_queue_popped_total";
    pub const QUEUE_DELETED: &str = "stratus_queue_deleted_total";
    pub const INDEX_CONFLICTS: &str = "stratus_index_conflicts_total";
    pub const INDEX_COMMITS: &str = "stratus_index_commits_total";
    pub const STORE_RETRIES: &str = "stratus_store_retries_total";
    pub const STORE_ACTIVE_LEASES: &str = "stratus_store_active_leases";
}
