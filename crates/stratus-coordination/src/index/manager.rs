//! Optimistic read-modify-write of a shared index object

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stratus_common::{
    Backoff, CancellationToken, IndexConfig, Result, StratusError, metric_names, sleep_or_cancel,
};
use stratus_store::{LeaseToken, PutCondition, StoreError, VersionToken};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::model::{IndexDocument, IndexMutation, IndexRecord};
use crate::lock::{AcquireOptions, LockContext, LockHandle, LockManager};
use crate::store_client::StoreClient;

struct CachedIndex {
    document: Arc<IndexDocument>,
    version: Option<VersionToken>,
    fetched_at: Instant,
}

/// Result of an index update
#[derive(Debug, Clone)]
pub struct UpdateOutcome<R> {
    /// What the mutation returned on the attempt that finished the update
    pub value: R,
    pub attempts: u32,
    /// Version of the index after the update; `None` if it still does not exist
    pub version: Option<VersionToken>,
    /// False when the mutation left the index unchanged and nothing was written
    pub committed: bool,
}

/// Manages one index object with fetch, mutate and conditional commit.
///
/// A commit only succeeds against the version it was computed from. On a
/// conflict the latest index is fetched again and the mutation re-applied,
/// up to `retry_budget` attempts in total.
#[derive(Clone)]
pub struct IndexManager {
    path: Arc<str>,
    store: StoreClient,
    locks: LockManager,
    config: IndexConfig,
    cache: Arc<Mutex<Option<CachedIndex>>>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("path", &self.path)
            .field("retry_budget", &self.config.retry_budget)
            .field("lock_writes", &self.config.lock_writes)
            .finish()
    }
}

impl IndexManager {
    pub fn new(
        path: impl Into<String>,
        store: StoreClient,
        locks: LockManager,
        config: IndexConfig,
    ) -> Self {
        Self {
            path: Arc::from(path.into()),
            store,
            locks,
            config,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Read the index from the store; a missing index reads as empty.
    pub async fn fetch(&self) -> Result<(IndexDocument, Option<VersionToken>)> {
        let (document, version) = match self.store.get_opt(&self.path).await? {
            Some(object) => (IndexDocument::from_bytes(&object.data)?, Some(object.version)),
            None => (IndexDocument::default(), None),
        };
        self.remember(&document, version.clone());
        Ok((document, version))
    }

    /// The index, served from cache while it is younger than `cache_ttl_ms`.
    pub async fn snapshot(&self) -> Result<Arc<IndexDocument>> {
        if let Some(ttl) = self.config.cache_ttl() {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < ttl
            {
                return Ok(cached.document.clone());
            }
        }
        let (document, _) = self.fetch().await?;
        Ok(Arc::new(document))
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<IndexRecord>> {
        Ok(self.snapshot().await?.get(key).cloned())
    }

    /// Version of the cached index, if any was read or written yet
    pub fn cached_version(&self) -> Option<VersionToken> {
        self.cache.lock().as_ref().and_then(|c| c.version.clone())
    }

    pub fn invalidate(&self) {
        self.cache.lock().take();
    }

    fn remember(&self, document: &IndexDocument, version: Option<VersionToken>) {
        if self.config.cache_ttl().is_none() {
            return;
        }
        *self.cache.lock() = Some(CachedIndex {
            document: Arc::new(document.clone()),
            version,
            fetched_at: Instant::now(),
        });
    }

    /// Apply `mutation` and return the records it replaced or removed.
    pub async fn commit(
        &self,
        mutation: &IndexMutation,
    ) -> Result<UpdateOutcome<BTreeMap<String, IndexRecord>>> {
        self.update(|document| Ok(mutation.apply(document))).await
    }

    pub async fn update<R, F>(&self, mutate: F) -> Result<UpdateOutcome<R>>
    where
        F: FnMut(&mut IndexDocument) -> Result<R>,
    {
        self.update_with(&CancellationToken::new(), mutate).await
    }

    /// Run the fetch, mutate and commit cycle until a commit lands.
    ///
    /// `mutate` runs once per attempt against the freshly fetched index and
    /// must derive its change from that document alone. An error from
    /// `mutate` aborts the update without writing.
    pub async fn update_with<R, F>(
        &self,
        cancel: &CancellationToken,
        mut mutate: F,
    ) -> Result<UpdateOutcome<R>>
    where
        F: FnMut(&mut IndexDocument) -> Result<R>,
    {
        let lock = if self.config.lock_writes {
            Some(self.lock_index(cancel).await?)
        } else {
            None
        };
        let token = lock.as_ref().map(|handle| handle.token().clone());

        let result = self.commit_loop(cancel, token.as_ref(), &mut mutate).await;

        if let Some(handle) = lock
            && let Err(e) = self.locks.release(&handle).await
        {
            warn!(path = %self.path, error = %e, "Failed to release index lock");
        }
        result
    }

    async fn lock_index(&self, cancel: &CancellationToken) -> Result<LockHandle> {
        // Every commit is its own holder so concurrent commits in one process exclude each other.
        let context = LockContext::Custom(format!("index-commit-{}", uuid::Uuid::new_v4()));
        self.locks
            .acquire_with(
                &self.path,
                context,
                AcquireOptions::new()
                    .lease(self.config.lock_lease())
                    .cancel(cancel.clone()),
            )
            .await
    }

    async fn commit_loop<R, F>(
        &self,
        cancel: &CancellationToken,
        lease: Option<&LeaseToken>,
        mutate: &mut F,
    ) -> Result<UpdateOutcome<R>>
    where
        F: FnMut(&mut IndexDocument) -> Result<R>,
    {
        let budget = self.config.retry_budget;
        let mut backoff = Backoff::new(&self.config.backoff);

        for attempt in 1..=budget {
            if cancel.is_cancelled() {
                return Err(StratusError::Cancelled);
            }

            let (mut document, version) = self.fetch().await?;
            let before = document.clone();
            let value = mutate(&mut document)?;
            if document == before {
                return Ok(UpdateOutcome {
                    value,
                    attempts: attempt,
                    version,
                    committed: false,
                });
            }

            let condition = match &version {
                Some(version) => PutCondition::IfMatch(version.clone()),
                None => PutCondition::IfNotExists,
            };
            match self
                .store
                .put(&self.path, document.to_bytes()?, condition, lease)
                .await
            {
                Ok(new_version) => {
                    metrics::counter!(metric_names::INDEX_COMMITS).increment(1);
                    debug!(path = %self.path, attempt, records = document.len(), "Index committed");
                    self.remember(&document, Some(new_version.clone()));
                    return Ok(UpdateOutcome {
                        value,
                        attempts: attempt,
                        version: Some(new_version),
                        committed: true,
                    });
                }
                Err(StoreError::ConditionFailed(_)) => {
                    metrics::counter!(metric_names::INDEX_CONFLICTS).increment(1);
                    debug!(path = %self.path, attempt, "Index changed concurrently, retrying");
                    if attempt < budget {
                        sleep_or_cancel(backoff.next_delay(), cancel).await?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.invalidate();
        warn!(path = %self.path, attempts = budget, "Index retry budget exhausted");
        Err(StratusError::IndexConflict {
            path: self.path.to_string(),
            attempts: budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stratus_common::{LockConfig, StorageConfig};
    use stratus_store::MemoryStore;

    use super::*;

    fn manager(store: &Arc<MemoryStore>, config: IndexConfig) -> IndexManager {
        let client = StoreClient::new(store.clone(), StorageConfig::default());
        let locks = LockManager::new(client.clone(), LockConfig::default(), "app");
        IndexManager::new("dict/__index__", client, locks, config)
    }

    fn unlocked() -> IndexConfig {
        IndexConfig {
            lock_writes: false,
            ..IndexConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_index_reads_empty() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, IndexConfig::default());

        let (doc, version) = index.fetch().await.unwrap();
        assert!(doc.is_empty());
        assert!(version.is_none());
        assert!(index.lookup("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_creates_then_updates() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, IndexConfig::default());

        let first = index
            .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a.1")))
            .await
            .unwrap();
        assert!(first.committed);
        assert_eq!(first.attempts, 1);
        assert!(first.value.is_empty());

        let second = index
            .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a.2")))
            .await
            .unwrap();
        assert_eq!(second.value["a"].blob_path, "blob/a.1");
        assert_ne!(first.version, second.version);
        assert_eq!(
            index.lookup("a").await.unwrap().unwrap().blob_path,
            "blob/a.2"
        );

        // The index lock is gone once the commit returns.
        assert_eq!(store.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_index_is_not_written() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, unlocked());

        let outcome = index
            .commit(&IndexMutation::new().remove("absent"))
            .await
            .unwrap();
        assert!(!outcome.committed);
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_retried_against_fresh_index() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, unlocked());
        store.inject_condition_failures(2);

        let outcome = index
            .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert!(index.lookup("a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_fails_with_conflict() {
        let store = Arc::new(MemoryStore::new());
        let config = IndexConfig {
            retry_budget: 3,
            ..unlocked()
        };
        let index = manager(&store, config);
        store.inject_condition_failures(10);

        let result = index
            .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
            .await;
        assert!(matches!(
            result,
            Err(StratusError::IndexConflict { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writer_changes_are_merged() {
        let store = Arc::new(MemoryStore::new());
        let ours = manager(&store, unlocked());
        let theirs = manager(&store, unlocked());

        ours.commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
            .await
            .unwrap();

        // Their commit lands between our fetch and our put.
        let mut raced = false;
        let outcome = ours
            .update(|doc| {
                if !raced {
                    raced = true;
                    futures::executor::block_on(theirs.commit(
                        &IndexMutation::new().upsert(IndexRecord::new("b", "blob/b")),
                    ))
                    .unwrap();
                }
                doc.insert(IndexRecord::new("c", "blob/c"));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        let (doc, _) = ours.fetch().await.unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mutate_error_aborts_without_write() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, IndexConfig::default());

        let result: Result<UpdateOutcome<()>> = index
            .update(|_| Err(StratusError::invalid_key("x", "rejected")))
            .await;
        assert!(matches!(result, Err(StratusError::InvalidKey { .. })));
        assert_eq!(store.object_count(), 0);
        assert_eq!(store.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_cache_honours_ttl() {
        let store = Arc::new(MemoryStore::new());
        let config = IndexConfig {
            cache_ttl_ms: 1000,
            ..unlocked()
        };
        let cached = manager(&store, config);
        let writer = manager(&store, unlocked());

        assert!(cached.snapshot().await.unwrap().is_empty());
        writer
            .commit(&IndexMutation::new().upsert(IndexRecord::new("a", "blob/a")))
            .await
            .unwrap();

        assert!(cached.snapshot().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(cached.snapshot().await.unwrap().len(), 1);
        assert!(cached.cached_version().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_update_leaves_index_untouched() {
        let store = Arc::new(MemoryStore::new());
        let index = manager(&store, unlocked());
        store.inject_condition_failures(100);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let result = index
            .update_with(&cancel, |doc| {
                doc.insert(IndexRecord::new("a", "blob/a"));
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StratusError::Cancelled)));
        assert_eq!(store.object_count(), 0);
    }
}
