//! The storage seam every coordination primitive is built on

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::StoreResult;
use crate::model::{
    LeaseInfo, LeaseToken, PutCondition, ReceiptHandle, ReceivedMessage, StoredObject,
    VersionToken,
};

/// Byte-level object, lease and queue primitives of a remote store.
///
/// Implementations must make `put` conditions and `lease_acquire` atomic:
/// every higher-level guarantee (mutual exclusion, lossless index commits)
/// rests on exactly one of several racing callers winning.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    // --- Objects ---

    async fn get(&self, path: &str) -> StoreResult<StoredObject>;

    /// Write `data`, honouring `condition`.
    ///
    /// A path under a live lease is writable only with the matching `lease`.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        condition: PutCondition,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<VersionToken>;

    /// Remove `path`; `NotFound` if absent, `NotHolder` if leased by someone else.
    async fn delete(&self, path: &str, lease: Option<&LeaseToken>) -> StoreResult<()>;

    /// Paths under `prefix`, lexicographically ordered.
    ///
    /// With a `delimiter`, paths that continue past it are rolled up into a
    /// single `prefix/child<delimiter>` entry.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
    ) -> BoxStream<'a, StoreResult<String>>;

    // --- Leases ---

    /// Take an exclusive lease; `Conflict` while another live lease exists.
    async fn lease_acquire(&self, path: &str, duration: Duration) -> StoreResult<LeaseToken>;

    /// Extend a lease; `NotHolder` when `token` is no longer the lease on its path.
    async fn lease_renew(&self, token: &LeaseToken, duration: Duration) -> StoreResult<()>;

    /// Drop a lease; succeeds when it is already gone.
    async fn lease_release(&self, token: &LeaseToken) -> StoreResult<()>;

    async fn lease_status(&self, path: &str) -> StoreResult<Option<LeaseInfo>>;

    // --- Queues ---

    /// Create a queue; succeeds if it exists.
    async fn queue_create(&self, queue: &str) -> StoreResult<()>;

    async fn queue_destroy(&self, queue: &str) -> StoreResult<()>;

    /// Approximate number of undeleted messages
    async fn queue_len(&self, queue: &str) -> StoreResult<usize>;

    async fn queue_send(&self, queue: &str, payloads: Vec<Bytes>) -> StoreResult<()>;

    /// Up to `count` visible messages, hidden for `visibility` afterwards.
    async fn queue_receive(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>>;

    /// Hide the message for `visibility` from now; returns the new receipt.
    ///
    /// `LeaseExpired` when the receipt is stale or its visibility lapsed.
    async fn queue_update_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> StoreResult<ReceiptHandle>;

    /// Delete the message; succeeds when it is already gone.
    async fn queue_delete(&self, receipt: &ReceiptHandle) -> StoreResult<()>;
}
