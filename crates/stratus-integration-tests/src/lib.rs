//! Fixtures shared by the integration test binaries

use std::sync::Arc;
use std::time::Duration;

use stratus_common::{BackoffConfig, StratusConfig};
use stratus_coordination::Coordinator;
use stratus_store::{MemoryStore, MemoryStoreOptions};

/// Store shared by every participant of a test, with `latency_ms` per call
/// so concurrent participants interleave.
pub fn shared_store(latency_ms: u64) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_options(
        MemoryStoreOptions::default().latency(Duration::from_millis(latency_ms)),
    ))
}

/// Defaults with short waits so contended tests finish quickly.
pub fn fast_config() -> StratusConfig {
    let mut config = StratusConfig::default();
    config.lock.backoff = BackoffConfig::new(2, 20, 2);
    config.lock.acquire_timeout_ms = 10_000;
    config.index.backoff = BackoffConfig::new(1, 20, 2);
    config.index.retry_budget = 64;
    config.queue.poll_interval_ms = 5;
    config.queue.max_poll_interval_ms = 20;
    config
}

/// A participant with its own application id.
pub fn participant(store: &Arc<MemoryStore>) -> Coordinator {
    Coordinator::new(store.clone(), fast_config()).expect("valid test configuration")
}
