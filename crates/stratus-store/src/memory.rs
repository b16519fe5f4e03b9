//! In-memory reference implementation of [`StoreAdapter`]
//!
//! Behaves like a single-region object/queue store: conditional puts and
//! lease grants are atomic per path, leases lapse on their own, and queue
//! messages reappear once their visibility window ends. Time is read from
//! `tokio::time`, so paused-clock tests can drive expiry deterministically.
//!
//! Lock ordering: a lease shard is always taken before an object shard.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use stratus_common::{deadline_after, metric_names, saturating_add};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::adapter::StoreAdapter;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    LeaseInfo, LeaseToken, PutCondition, ReceiptHandle, ReceivedMessage, StoredObject,
    VersionToken,
};

/// Construction options for [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    /// Longest lease granted by one acquire/renew call; `None` grants as asked
    pub max_lease_duration: Option<Duration>,
    /// Artificial delay before every call, widens race windows in tests
    pub latency: Duration,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            max_lease_duration: Some(Duration::from_secs(60)),
            latency: Duration::ZERO,
        }
    }
}

impl MemoryStoreOptions {
    pub fn max_lease_duration(mut self, max: Option<Duration>) -> Self {
        self.max_lease_duration = max;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[derive(Debug, Clone)]
struct ObjectEntry {
    data: Bytes,
    version: u64,
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    lease_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Bytes,
    enqueue_time: DateTime<Utc>,
    visible_at: Instant,
    pop_receipt: Option<String>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Inner {
    objects: DashMap<String, ObjectEntry>,
    leases: DashMap<String, LeaseEntry>,
    queues: DashMap<String, QueueState>,
    version: AtomicU64,
    options: MemoryStoreOptions,
    /// Remaining calls that fail with `Unavailable`
    unavailable: AtomicU32,
    /// Remaining conditional puts that fail with `ConditionFailed`
    condition_failures: AtomicU32,
}

/// In-process store shared by every participant holding the same `Arc`
#[derive(Debug)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    sweeper: Option<JoinHandle<()>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryStoreOptions::default())
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: DashMap::new(),
                leases: DashMap::new(),
                queues: DashMap::new(),
                version: AtomicU64::new(1),
                options,
                unavailable: AtomicU32::new(0),
                condition_failures: AtomicU32::new(0),
            }),
            sweeper: None,
        }
    }

    /// Start a background task that drops lapsed leases every `interval`
    /// and publishes the active lease count. Must be called inside a runtime.
    pub fn with_sweeper(mut self, interval: Duration) -> Self {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = inner.sweep_leases();
                if swept > 0 {
                    debug!(swept, "Swept expired leases");
                }
            }
        });
        self.sweeper = Some(handle);
        self
    }

    /// Make the next `calls` operations fail with `Unavailable`.
    pub fn set_unavailable(&self, calls: u32) {
        self.inner.unavailable.store(calls, Ordering::SeqCst);
    }

    /// Make the next `count` conditional puts fail with `ConditionFailed`.
    pub fn inject_condition_failures(&self, count: u32) {
        self.inner.condition_failures.store(count, Ordering::SeqCst);
    }

    /// Number of live leases
    pub fn active_leases(&self) -> usize {
        let now = Instant::now();
        self.inner
            .leases
            .iter()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    async fn before_call(&self) -> StoreResult<()> {
        if !self.inner.options.latency.is_zero() {
            tokio::time::sleep(self.inner.options.latency).await;
        }
        if take_one(&self.inner.unavailable) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

/// Decrement `counter` if positive; true when a unit was taken.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn wall_clock_after(duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Inner {
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst)
    }

    fn clamp_lease(&self, duration: Duration) -> Duration {
        match self.options.max_lease_duration {
            Some(max) => duration.min(max),
            None => duration,
        }
    }

    fn sweep_leases(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.is_live(now));
        let remaining = self.leases.len();
        metrics::gauge!(metric_names::STORE_ACTIVE_LEASES).set(remaining as f64);
        before.saturating_sub(remaining)
    }

    /// Fails with `NotHolder` when `path` is leased to someone other than `lease`.
    fn check_writable(
        &self,
        path: &str,
        lease_entry: Option<&LeaseEntry>,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<()> {
        match lease_entry {
            Some(entry) if entry.is_live(Instant::now()) => match lease {
                Some(token) if token.lease_id == entry.lease_id => Ok(()),
                _ => Err(StoreError::NotHolder(path.to_string())),
            },
            _ => Ok(()),
        }
    }

    fn get(&self, path: &str) -> StoreResult<StoredObject> {
        self.objects
            .get(path)
            .map(|entry| StoredObject {
                data: entry.data.clone(),
                version: VersionToken(entry.version.to_string()),
            })
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn put(
        &self,
        path: &str,
        data: Bytes,
        condition: PutCondition,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<VersionToken> {
        let lease_entry = self.leases.get(path);
        self.check_writable(path, lease_entry.as_deref(), lease)?;

        if condition != PutCondition::None && take_one(&self.condition_failures) {
            return Err(StoreError::ConditionFailed(path.to_string()));
        }

        let version = match self.objects.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                let matches = match &condition {
                    PutCondition::None => true,
                    PutCondition::IfNotExists => false,
                    PutCondition::IfMatch(expected) => {
                        expected.as_str() == occupied.get().version.to_string()
                    }
                };
                if !matches {
                    return Err(StoreError::ConditionFailed(path.to_string()));
                }
                let version = self.next_version();
                occupied.insert(ObjectEntry { data, version });
                version
            }
            Entry::Vacant(vacant) => {
                if let PutCondition::IfMatch(_) = condition {
                    return Err(StoreError::ConditionFailed(path.to_string()));
                }
                let version = self.next_version();
                vacant.insert(ObjectEntry { data, version });
                version
            }
        };

        trace!(path, version, "Object written");
        Ok(VersionToken(version.to_string()))
    }

    fn delete(&self, path: &str, lease: Option<&LeaseToken>) -> StoreResult<()> {
        let lease_entry = self.leases.get(path);
        self.check_writable(path, lease_entry.as_deref(), lease)?;

        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn list_paths(&self, prefix: &str, delimiter: Option<&str>) -> Vec<String> {
        let mut paths = BTreeSet::new();
        for entry in self.objects.iter() {
            let key = entry.key();
            let Some(remainder) = key.strip_prefix(prefix) else {
                continue;
            };
            match delimiter.filter(|d| !d.is_empty()) {
                Some(delim) => match remainder.find(delim) {
                    Some(pos) => {
                        paths.insert(format!("{}{}", prefix, &remainder[..pos + delim.len()]));
                    }
                    None => {
                        paths.insert(key.clone());
                    }
                },
                None => {
                    paths.insert(key.clone());
                }
            }
        }
        paths.into_iter().collect()
    }

    fn lease_acquire(&self, path: &str, duration: Duration) -> StoreResult<LeaseToken> {
        let now = Instant::now();
        let lease = LeaseEntry {
            lease_id: new_id(),
            acquired_at: Utc::now(),
            expires_at: saturating_add(now, self.clamp_lease(duration)),
        };
        let token = LeaseToken::new(path, lease.lease_id.clone());

        match self.leases.entry(path.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_live(now) => {
                trace!(path, "Lease conflict");
                Err(StoreError::Conflict(path.to_string()))
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(lease);
                Ok(token)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(token)
            }
        }
    }

    fn lease_renew(&self, token: &LeaseToken, duration: Duration) -> StoreResult<()> {
        match self.leases.get_mut(&token.path) {
            Some(mut lease) if lease.lease_id == token.lease_id => {
                lease.expires_at = deadline_after(self.clamp_lease(duration));
                Ok(())
            }
            _ => Err(StoreError::NotHolder(token.path.clone())),
        }
    }

    fn lease_release(&self, token: &LeaseToken) -> StoreResult<()> {
        match self.leases.entry(token.path.clone()) {
            Entry::Occupied(occupied) if occupied.get().lease_id == token.lease_id => {
                occupied.remove();
                Ok(())
            }
            Entry::Occupied(occupied) if occupied.get().is_live(Instant::now()) => {
                Err(StoreError::NotHolder(token.path.clone()))
            }
            _ => Ok(()),
        }
    }

    fn lease_status(&self, path: &str) -> Option<LeaseInfo> {
        let now = Instant::now();
        self.leases
            .get(path)
            .filter(|lease| lease.is_live(now))
            .map(|lease| LeaseInfo {
                lease_id: lease.lease_id.clone(),
                acquired_at: lease.acquired_at,
                expires_in: lease.expires_at - now,
            })
    }

    fn queue_send(&self, queue: &str, payloads: Vec<Bytes>) -> StoreResult<()> {
        let mut state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
        let now = Instant::now();
        for payload in payloads {
            state.messages.push_back(StoredMessage {
                id: new_id(),
                payload,
                enqueue_time: Utc::now(),
                visible_at: now,
                pop_receipt: None,
                delivery_count: 0,
            });
        }
        Ok(())
    }

    fn queue_receive(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        let mut state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
        let now = Instant::now();
        let visible_until = wall_clock_after(visibility);

        let received = state
            .messages
            .iter_mut()
            .filter(|message| message.visible_at <= now)
            .take(count)
            .map(|message| {
                let receipt = new_id();
                message.pop_receipt = Some(receipt.clone());
                message.visible_at = saturating_add(now, visibility);
                message.delivery_count += 1;
                ReceivedMessage {
                    message_id: message.id.clone(),
                    payload: message.payload.clone(),
                    receipt: ReceiptHandle {
                        queue: queue.to_string(),
                        message_id: message.id.clone(),
                        pop_receipt: receipt,
                    },
                    enqueue_time: message.enqueue_time,
                    visible_until,
                    delivery_count: message.delivery_count,
                }
            })
            .collect();
        Ok(received)
    }

    fn queue_update_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> StoreResult<ReceiptHandle> {
        let mut state = self
            .queues
            .get_mut(&receipt.queue)
            .ok_or_else(|| StoreError::QueueNotFound(receipt.queue.clone()))?;
        let now = Instant::now();
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.id == receipt.message_id)
            .ok_or_else(|| StoreError::NotFound(receipt.message_id.clone()))?;

        let current = message.pop_receipt.as_deref() == Some(receipt.pop_receipt.as_str());
        if !current || message.visible_at <= now {
            return Err(StoreError::LeaseExpired(receipt.message_id.clone()));
        }

        let new_receipt = new_id();
        message.pop_receipt = Some(new_receipt.clone());
        message.visible_at = saturating_add(now, visibility);
        Ok(ReceiptHandle {
            queue: receipt.queue.clone(),
            message_id: receipt.message_id.clone(),
            pop_receipt: new_receipt,
        })
    }

    fn queue_delete(&self, receipt: &ReceiptHandle) -> StoreResult<()> {
        let Some(mut state) = self.queues.get_mut(&receipt.queue) else {
            return Ok(());
        };
        let Some(pos) = state
            .messages
            .iter()
            .position(|message| message.id == receipt.message_id)
        else {
            return Ok(());
        };
        if state.messages[pos].pop_receipt.as_deref() != Some(receipt.pop_receipt.as_str()) {
            return Err(StoreError::LeaseExpired(receipt.message_id.clone()));
        }
        state.messages.remove(pos);
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<StoredObject> {
        self.before_call().await?;
        self.inner.get(path)
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        condition: PutCondition,
        lease: Option<&LeaseToken>,
    ) -> StoreResult<VersionToken> {
        self.before_call().await?;
        self.inner.put(path, data, condition, lease)
    }

    async fn delete(&self, path: &str, lease: Option<&LeaseToken>) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.delete(path, lease)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        delimiter: Option<&'a str>,
    ) -> BoxStream<'a, StoreResult<String>> {
        stream::once(async move {
            self.before_call().await?;
            let paths = self.inner.list_paths(prefix, delimiter);
            Ok::<_, StoreError>(stream::iter(paths.into_iter().map(Ok)))
        })
        .try_flatten()
        .boxed()
    }

    async fn lease_acquire(&self, path: &str, duration: Duration) -> StoreResult<LeaseToken> {
        self.before_call().await?;
        self.inner.lease_acquire(path, duration)
    }

    async fn lease_renew(&self, token: &LeaseToken, duration: Duration) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.lease_renew(token, duration)
    }

    async fn lease_release(&self, token: &LeaseToken) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.lease_release(token)
    }

    async fn lease_status(&self, path: &str) -> StoreResult<Option<LeaseInfo>> {
        self.before_call().await?;
        Ok(self.inner.lease_status(path))
    }

    async fn queue_create(&self, queue: &str) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn queue_destroy(&self, queue: &str) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.queues.remove(queue);
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> StoreResult<usize> {
        self.before_call().await?;
        self.inner
            .queues
            .get(queue)
            .map(|state| state.messages.len())
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))
    }

    async fn queue_send(&self, queue: &str, payloads: Vec<Bytes>) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.queue_send(queue, payloads)
    }

    async fn queue_receive(
        &self,
        queue: &str,
        count: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<ReceivedMessage>> {
        self.before_call().await?;
        self.inner.queue_receive(queue, count, visibility)
    }

    async fn queue_update_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility: Duration,
    ) -> StoreResult<ReceiptHandle> {
        self.before_call().await?;
        self.inner.queue_update_visibility(receipt, visibility)
    }

    async fn queue_delete(&self, receipt: &ReceiptHandle) -> StoreResult<()> {
        self.before_call().await?;
        self.inner.queue_delete(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        let v1 = store
            .put("a/b", bytes("one"), PutCondition::None, None)
            .await
            .unwrap();
        let object = store.get("a/b").await.unwrap();
        assert_eq!(object.data, bytes("one"));
        assert_eq!(object.version, v1);

        let v2 = store
            .put("a/b", bytes("two"), PutCondition::None, None)
            .await
            .unwrap();
        assert_ne!(v1, v2);

        store.delete("a/b", None).await.unwrap();
        assert_eq!(
            store.get("a/b").await.unwrap_err(),
            StoreError::NotFound("a/b".to_string())
        );
        assert!(matches!(
            store.delete("a/b", None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_conditions() {
        let store = MemoryStore::new();

        let v1 = store
            .put("idx", bytes("{}"), PutCondition::IfNotExists, None)
            .await
            .unwrap();
        assert!(matches!(
            store
                .put("idx", bytes("{}"), PutCondition::IfNotExists, None)
                .await,
            Err(StoreError::ConditionFailed(_))
        ));

        let v2 = store
            .put("idx", bytes("[1]"), PutCondition::IfMatch(v1.clone()), None)
            .await
            .unwrap();

        // Stale version loses
        assert!(matches!(
            store
                .put("idx", bytes("[2]"), PutCondition::IfMatch(v1), None)
                .await,
            Err(StoreError::ConditionFailed(_))
        ));
        assert_eq!(store.get("idx").await.unwrap().version, v2);

        assert!(matches!(
            store
                .put(
                    "missing",
                    bytes("x"),
                    PutCondition::IfMatch(VersionToken("1".to_string())),
                    None
                )
                .await,
            Err(StoreError::ConditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let store = MemoryStore::new();
        for path in ["root/a", "root/b/x", "root/b/y", "root/c/z/w", "other/q"] {
            store
                .put(path, bytes("v"), PutCondition::None, None)
                .await
                .unwrap();
        }

        let flat: Vec<String> = store.list("root/", None).try_collect().await.unwrap();
        assert_eq!(flat, vec!["root/a", "root/b/x", "root/b/y", "root/c/z/w"]);

        let rolled: Vec<String> = store
            .list("root/", Some("/"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rolled, vec!["root/a", "root/b/", "root/c/"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_exclusive_until_expiry() {
        let store = MemoryStore::new();

        let token = store
            .lease_acquire("locks/job", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(
            store.lease_acquire("locks/job", Duration::from_secs(10)).await,
            Err(StoreError::Conflict(_))
        ));

        let status = store.lease_status("locks/job").await.unwrap().unwrap();
        assert!(status.is_held_by(&token));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.lease_status("locks/job").await.unwrap().is_none());

        let next = store
            .lease_acquire("locks/job", Duration::from_secs(10))
            .await
            .unwrap();
        assert_ne!(next.lease_id, token.lease_id);

        // The old holder can neither renew nor release the new lease.
        assert!(matches!(
            store.lease_renew(&token, Duration::from_secs(10)).await,
            Err(StoreError::NotHolder(_))
        ));
        assert!(matches!(
            store.lease_release(&token).await,
            Err(StoreError::NotHolder(_))
        ));
        store.lease_release(&next).await.unwrap();
        store.lease_release(&next).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_clamped_to_max() {
        let store = MemoryStore::with_options(
            MemoryStoreOptions::default().max_lease_duration(Some(Duration::from_secs(5))),
        );
        store
            .lease_acquire("p", Duration::from_secs(3600))
            .await
            .unwrap();
        let status = store.lease_status("p").await.unwrap().unwrap();
        assert!(status.expires_in <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_leased_path_rejects_foreign_writes() {
        let store = MemoryStore::new();
        let token = store
            .lease_acquire("dict/k", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(matches!(
            store.put("dict/k", bytes("x"), PutCondition::None, None).await,
            Err(StoreError::NotHolder(_))
        ));
        let foreign = LeaseToken::new("dict/k", "someone-else");
        assert!(matches!(
            store
                .put("dict/k", bytes("x"), PutCondition::None, Some(&foreign))
                .await,
            Err(StoreError::NotHolder(_))
        ));

        store
            .put("dict/k", bytes("x"), PutCondition::None, Some(&token))
            .await
            .unwrap();
        assert!(matches!(
            store.delete("dict/k", None).await,
            Err(StoreError::NotHolder(_))
        ));
        store.delete("dict/k", Some(&token)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_redelivery_after_visibility_lapse() {
        let store = MemoryStore::new();
        store.queue_create("jobs").await.unwrap();
        store
            .queue_send("jobs", vec![bytes("m1"), bytes("m2")])
            .await
            .unwrap();

        let first = store
            .queue_receive("jobs", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, bytes("m1"));
        assert_eq!(first[0].delivery_count, 1);

        let second = store
            .queue_receive("jobs", 5, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, bytes("m2"));

        tokio::time::advance(Duration::from_secs(31)).await;

        let again = store
            .queue_receive("jobs", 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].delivery_count, 2);

        // The first receipt is stale now.
        assert!(matches!(
            store
                .queue_update_visibility(&first[0].receipt, Duration::from_secs(30))
                .await,
            Err(StoreError::LeaseExpired(_))
        ));
        assert!(matches!(
            store.queue_delete(&first[0].receipt).await,
            Err(StoreError::LeaseExpired(_))
        ));

        store.queue_delete(&again[0].receipt).await.unwrap();
        store.queue_delete(&again[0].receipt).await.unwrap();
        assert_eq!(store.queue_len("jobs").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_update_visibility() {
        let store = MemoryStore::new();
        store.queue_create("q").await.unwrap();
        store.queue_send("q", vec![bytes("x")]).await.unwrap();

        let received = store
            .queue_receive("q", 1, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        let renewed = store
            .queue_update_visibility(&received[0].receipt, Duration::from_secs(10))
            .await
            .unwrap();
        assert_ne!(renewed.pop_receipt, received[0].receipt.pop_receipt);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(
            store
                .queue_receive("q", 1, Duration::from_secs(10))
                .await
                .unwrap()
                .is_empty()
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            store
                .queue_update_visibility(&renewed, Duration::from_secs(10))
                .await,
            Err(StoreError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_requires_create() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.queue_send("nope", vec![bytes("x")]).await,
            Err(StoreError::QueueNotFound(_))
        ));
        store.queue_create("q").await.unwrap();
        store.queue_create("q").await.unwrap();
        store.queue_destroy("q").await.unwrap();
        assert!(matches!(
            store.queue_len("q").await,
            Err(StoreError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.set_unavailable(2);
        assert!(matches!(
            store.get("x").await,
            Err(StoreError::Unavailable(_))
        ));
        let listed: Result<Vec<String>, _> = store.list("", None).try_collect().await;
        assert!(matches!(listed, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.get("x").await, Err(StoreError::NotFound(_))));

        store.inject_condition_failures(1);
        assert!(matches!(
            store
                .put("x", bytes("1"), PutCondition::IfNotExists, None)
                .await,
            Err(StoreError::ConditionFailed(_))
        ));
        store
            .put("x", bytes("1"), PutCondition::IfNotExists, None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_lapsed_leases() {
        let store = MemoryStore::new().with_sweeper(Duration::from_secs(1));
        store
            .lease_acquire("a", Duration::from_secs(2))
            .await
            .unwrap();
        store
            .lease_acquire("b", Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(store.active_leases(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.inner.leases.len(), 1);
        assert_eq!(store.active_leases(), 1);
    }
}
