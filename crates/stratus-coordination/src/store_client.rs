//! Store access with bounded retries of transient failures
//!
//! Every coordination primitive reaches the store through [`StoreClient`].
//! `Unavailable` is retried with backoff up to `storage.max_attempts`;
//! every other outcome is handed back untouched so contention is always
//! decided by the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use stratus_common::{StorageConfig, metric_names, retry_transient};
use stratus_store::{
    LeaseInfo, LeaseToken, PutCondition, ReceiptHandle, ReceivedMessage, StoreAdapter,
    StoreError, StoreResult, StoredObject, VersionToken,
};
use tracing::warn;

#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn StoreAdapter>,
    config: StorageConfig,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StoreClient {
    pub fn new(store: Arc<dyn StoreAdapter>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    pub fn adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_transient(
            &self.config.backoff,
            self.config.max_attempts,
            |attempt, e: &StoreError| {
                metrics::counter!(metric_names::STORE_RETRIES, "operation" => operation)
                    .increment(1);
                warn!(operation, attempt, error = %e, "Transient store failure, retrying");
            },
            op,
        )
        .await
    }

    pub async fn get(&self, path: &str) -> StoreResult<StoredObject> {
        self.with_retry("get", || self.store.get(path)).await
    }

    /// Like `get`, with `NotFound` mapped to `None`.
    pub async fn get_opt(&self, path: &str) -> StoreResult<Option<StoredObject>> {
        match self.get(path).await {
            Ok(object) => Ok(Some(object)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(
        &self,
        path: &str,
        data: Bytes,
        condition: PutCondition,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<VersionToken> {
        self.with_retry("put", || {
            self.store.put(path, data.clone(), condition.clone(), lease)
        })
        .await
    }

    pub async fn delete(&self, path: &str, lease: Option<&LeaseToken>) -> StoreResult<()> {
        self.with_retry("delete", || self.store.delete(path, lease))
            .await
    }

    /// Delete, treating an already missing object as success.
    pub async fn delete_if_exists(
        &self,
        path: &str,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<bool> {
        match self.delete(path, lease).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Collect a full listing; the whole listing is retried on a transient failure.
    pub async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Vec<String>> {
        self.with_retry("list", || {
            self.store.list(prefix, delimiter).try_collect::<Vec<_>>()
        })
        .await
    }

    pub async fn lease_acquire(&self, path: &str, duration: Duration) -> StoreResult<LeaseToken> {
        self.with_retry("lease_acquire", || self.store.lease_acquire(path, duration))
            .await
    }

    pub async fn lease_renew(&self, token: &LeaseToken, duration: Duration) -> StoreResult<()> {
        self.with_retry("lease_renew", || self.store.lease_renew(token, duration))
            .await
    }

    pub async fn lease_release(&self, token: &LeaseToken) -> StoreResult<()> {
        self.with_retry("lease_release", || self.store.lease_release(token))
            .await
    }

    pub async fn lease_status(&self, path: &str) -> StoreResult<Option<LeaseInfo>> {
        self.with_retry("lease_status", || self.store.lease_status(path))
            .await
    }

    pub async fn queue_create(&self, queue: &str) -> StoreResult<()> {
        self.with_retry("queue_create", || self.store.queue_create(queue))
            .await
    }

    pub async fn queue_destroy(&self, queue: &str) -> StoreResult<()> {
        self.with_retry("queue_destroy", || self.store.queue_destroy(queue))
            .await
    }

    pub async fn queue_len(&self, queue: &str) -> StoreResult<usize> {
        self.with_retry("queue_len", || self.store.queue_len(queue))
            .await
    }

    pub async fn queue_send(&self, queue: &str, payloads: Vec<Bytes>) -> StoreResult<()> {
        self.with_retry("queue_send", || self.store.queue_send(queue, payloads.clone()))
            .await
    }

    pub async fn queue_receive(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        self.with_retry("queue_receive", || {
            self.store.queue_receive(queue, count, visibility)
        })
        .await
    }

    pub async fn queue_update_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> StoreResult<ReceiptHandle> {
        self.with_retry("queue_update_visibility", || {
            self.store.queue_update_visibility(receipt, visibility)
        })
        .await
    }

    pub async fn queue_delete(&self, receipt: &ReceiptHandle) -> StoreResult<()> {
        self.with_retry("queue_delete", || self.store.queue_delete(receipt))
            .await
    }
}
