//! Key-value namespace over the store

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use stratus_common::{
    DATA_PREFIX, DictionaryConfig, INDEX_OBJECT_SUFFIX, IndexConfig, Result, StratusError,
};
use stratus_store::{PutCondition, StoreError};
use tracing::{debug, warn};

use super::key_codec::KeyCodec;
use super::node::{DictionaryKind, DictionaryNode};
use crate::index::{IndexManager, IndexMutation, IndexRecord};
use crate::lock::{AcquireOptions, LockContext, LockHandle, LockManager};
use crate::store_client::StoreClient;

struct DictionaryInner {
    root: String,
    kind: DictionaryKind,
    store: StoreClient,
    locks: LockManager,
    codec: KeyCodec,
    index_config: IndexConfig,
    index: Option<IndexManager>,
    /// The dictionary this one is nested in and its segment there
    parent: Option<(RemoteDictionary, String)>,
}

/// A dictionary of byte values stored under a root prefix.
///
/// Keys containing the separator address nested dictionaries: `"a/b"` is
/// entry `b` of the sub-dictionary rooted at `a/`, and `"a/"` names that
/// sub-dictionary itself. Nested dictionaries share the kind, store and
/// lock manager of the dictionary they were reached from.
///
/// Store layout under `root`:
/// - `{root}{key}`: the value (non-indexed) and the lock resource of the entry
/// - `{root}__index__`: the index object (indexed)
/// - `{root}__data__/{key}.{uuid}`: one value blob per write (indexed)
#[derive(Clone)]
pub struct RemoteDictionary {
    inner: Arc<DictionaryInner>,
}

impl std::fmt::Debug for RemoteDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDictionary")
            .field("root", &self.inner.root)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl RemoteDictionary {
    /// Open the dictionary rooted at `root`.
    ///
    /// The dictionary takes entry locks as its own lock-manager instance, so
    /// two dictionaries opened from the same manager exclude each other.
    pub fn new(
        root: &str,
        kind: DictionaryKind,
        store: StoreClient,
        locks: &LockManager,
        index_config: IndexConfig,
        config: &DictionaryConfig,
    ) -> Result<Self> {
        let codec = KeyCodec::from_config(config);
        let separator = codec.separator();
        let root = if root.is_empty() || root.ends_with(separator) {
            root.to_string()
        } else {
            format!("{}{}", root, separator)
        };
        codec.check_path(&root, &root)?;

        Ok(Self::build(
            root,
            kind,
            store,
            locks.for_instance(),
            codec,
            index_config,
            None,
        ))
    }

    fn build(
        root: String,
        kind: DictionaryKind,
        store: StoreClient,
        locks: LockManager,
        codec: KeyCodec,
        index_config: IndexConfig,
        parent: Option<(RemoteDictionary, String)>,
    ) -> Self {
        let index = (kind == DictionaryKind::Indexed).then(|| {
            IndexManager::new(
                format!("{}{}", root, INDEX_OBJECT_SUFFIX),
                store.clone(),
                locks.clone(),
                index_config.clone(),
            )
        });
        Self {
            inner: Arc::new(DictionaryInner {
                root,
                kind,
                store,
                locks,
                codec,
                index_config,
                index,
                parent,
            }),
        }
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    pub fn kind(&self) -> DictionaryKind {
        self.inner.kind
    }

    pub fn separator(&self) -> &str {
        self.inner.codec.separator()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    fn child(&self, segment: &str) -> Result<Self> {
        let root = format!(
            "{}{}{}",
            self.inner.root,
            self.inner.codec.encode_segment(segment)?,
            self.separator()
        );
        self.inner.codec.check_path(segment, &root)?;
        Ok(Self::build(
            root,
            self.inner.kind,
            self.inner.store.clone(),
            self.inner.locks.clone(),
            self.inner.codec.clone(),
            self.inner.index_config.clone(),
            Some((self.clone(), segment.to_string())),
        ))
    }

    fn descend(&self, segments: &[&str]) -> Result<Self> {
        let mut current = self.clone();
        for segment in segments {
            current = current.child(segment)?;
        }
        Ok(current)
    }

    fn marker(&self, segment: &str) -> String {
        format!("{}{}", segment, self.separator())
    }

    /// Record this dictionary and every level above it in the parent's
    /// index so they show up in `keys`. Runs after a write succeeded, deepest
    /// level first, so a level is never linked before it holds a key.
    async fn link(&self) -> Result<()> {
        let mut current = self.clone();
        while let Some((parent, segment)) = current.inner.parent.clone() {
            let Some(index) = &parent.inner.index else {
                break;
            };
            let marker = parent.marker(&segment);
            let (document, _) = index.fetch().await?;
            if !document.contains(&marker) {
                let record = IndexRecord::new(marker, current.root().to_string());
                index.commit(&IndexMutation::new().upsert(record)).await?;
                debug!(root = %current.inner.root, "Sub-dictionary linked");
            }
            current = parent;
        }
        Ok(())
    }

    /// Drop the markers of this dictionary and of the levels above it while
    /// they hold no keys.
    async fn unlink_if_empty(&self) -> Result<()> {
        let mut current = self.clone();
        while let Some((parent, segment)) = current.inner.parent.clone() {
            let (Some(index), Some(parent_index)) = (&current.inner.index, &parent.inner.index)
            else {
                break;
            };
            if !index.fetch().await?.0.is_empty() {
                break;
            }
            let marker = parent.marker(&segment);
            parent_index
                .commit(&IndexMutation::new().remove(marker.clone()))
                .await?;

            // A writer that filled the level meanwhile may have seen the old
            // marker and skipped linking.
            if !index.fetch().await?.0.is_empty() {
                let record = IndexRecord::new(marker, current.root().to_string());
                parent_index
                    .commit(&IndexMutation::new().upsert(record))
                    .await?;
                break;
            }
            debug!(root = %current.inner.root, "Empty sub-dictionary unlinked");
            current = parent;
        }
        Ok(())
    }

    fn entry_name<'k>(&self, key: &'k str) -> Result<(Vec<&'k str>, &'k str)> {
        match self.inner.codec.split(key)? {
            (segments, Some(name)) => Ok((segments, name)),
            (_, None) => Err(StratusError::invalid_key(key, "names a sub-dictionary")),
        }
    }

    /// The dictionary holding `key` and the entry name within it
    fn resolve(&self, key: &str) -> Result<(Self, String)> {
        let (segments, name) = self.entry_name(key)?;
        let owner = self.descend(&segments)?;
        owner.entry_path(name)?;
        Ok((owner, name.to_string()))
    }

    fn entry_path(&self, name: &str) -> Result<String> {
        let path = format!("{}{}", self.inner.root, self.inner.codec.encode_segment(name)?);
        self.inner.codec.check_path(name, &path)?;
        Ok(path)
    }

    fn blob_path(&self, name: &str) -> Result<String> {
        let path = format!(
            "{}{}{}{}.{}",
            self.inner.root,
            DATA_PREFIX,
            self.separator(),
            self.inner.codec.encode_segment(name)?,
            uuid::Uuid::new_v4()
        );
        self.inner.codec.check_path(name, &path)?;
        Ok(path)
    }

    fn is_marker(&self, key: &str) -> bool {
        key.ends_with(self.separator())
    }

    fn index(&self) -> Result<&IndexManager> {
        self.inner.index.as_ref().ok_or_else(|| {
            StratusError::Internal(format!("dictionary '{}' is not indexed", self.inner.root))
        })
    }

    /// An entry locked by someone else may not be written by this caller.
    async fn check_writable(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        if self.inner.locks.token_for(&path).is_some() {
            return Ok(());
        }
        if self.inner.store.lease_status(&path).await?.is_some() {
            return Err(StratusError::not_holder(path));
        }
        Ok(())
    }

    async fn discard_blobs(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.inner.store.delete_if_exists(path, None).await {
                warn!(path = %path, error = %e, "Failed to delete stale value blob");
            }
        }
    }

    // Reads

    /// Value of `key`, or `None` when it is not set.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let (owner, name) = self.resolve(key)?;
        owner.get_entry(&name).await
    }

    async fn get_entry(&self, name: &str) -> Result<Option<Bytes>> {
        let Some(index) = &self.inner.index else {
            let path = self.entry_path(name)?;
            return Ok(self.inner.store.get_opt(&path).await?.map(|o| o.data));
        };

        let Some(record) = index.lookup(name).await? else {
            return Ok(None);
        };
        if let Some(object) = self.inner.store.get_opt(&record.blob_path).await? {
            return Ok(Some(object.data));
        }

        // Replaced after the index was read
        let (fresh, _) = index.fetch().await?;
        match fresh.get(name) {
            Some(current) if current.blob_path != record.blob_path => Ok(self
                .inner
                .store
                .get_opt(&current.blob_path)
                .await?
                .map(|o| o.data)),
            Some(_) => {
                warn!(root = %self.inner.root, key = name, "Index points at a missing blob");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn get_or(&self, key: &str, default: impl Into<Bytes>) -> Result<Bytes> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.into()))
    }

    /// Whether `key` is set; for a sub-dictionary key, whether it has any keys.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        let (segments, name) = self.inner.codec.split(key)?;
        let Some(name) = name else {
            return Ok(!self.descend(&segments)?.is_empty().await?);
        };
        let owner = self.descend(&segments)?;
        match &owner.inner.index {
            Some(index) => Ok(index.lookup(name).await?.is_some()),
            None => {
                let path = owner.entry_path(name)?;
                Ok(self.inner.store.get_opt(&path).await?.is_some())
            }
        }
    }

    /// Keys at this level, sorted. Sub-dictionaries are listed with a
    /// trailing separator.
    pub async fn keys(&self) -> Result<Vec<String>> {
        if let Some(index) = &self.inner.index {
            return Ok(index.snapshot().await?.keys().map(str::to_string).collect());
        }

        let separator = self.separator();
        let listed = self
            .inner
            .store
            .list(&self.inner.root, Some(separator))
            .await?;
        let mut keys = Vec::with_capacity(listed.len());
        for path in listed {
            let Some(name) = path.strip_prefix(self.inner.root.as_str()) else {
                continue;
            };
            let (encoded, nested) = match name.strip_suffix(separator) {
                Some(encoded) => (encoded, true),
                None => (name, false),
            };
            if KeyCodec::is_reserved(encoded) {
                continue;
            }
            match self.inner.codec.decode_segment(encoded) {
                Ok(key) if nested => keys.push(format!("{}{}", key, separator)),
                Ok(key) => keys.push(key),
                Err(_) => debug!(path = %path, "Skipping object not created by a dictionary"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.keys().await?.is_empty())
    }

    /// Entries at this level with their values; sub-dictionaries are skipped.
    pub async fn entries(&self) -> Result<Vec<(String, Bytes)>> {
        let keys: Vec<String> = self
            .keys()
            .await?
            .into_iter()
            .filter(|key| !self.is_marker(key))
            .collect();
        let values = try_join_all(keys.iter().map(|key| self.get_entry(key))).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    pub async fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<Bytes>>> {
        try_join_all(keys.iter().map(|key| self.get(key.as_ref()))).await
    }

    /// The current index records (indexed dictionaries only)
    pub async fn index_snapshot(&self) -> Result<Option<Vec<IndexRecord>>> {
        match &self.inner.index {
            Some(index) => Ok(Some(index.snapshot().await?.records().cloned().collect())),
            None => Ok(None),
        }
    }

    /// Resolve `key` to an entry value or, for keys ending in the
    /// separator, to the nested dictionary.
    pub async fn node(&self, key: &str) -> Result<Option<DictionaryNode>> {
        match self.inner.codec.split(key)? {
            (segments, None) => Ok(Some(DictionaryNode::SubDictionary(
                self.descend(&segments)?,
            ))),
            (_, Some(_)) => Ok(self.get(key).await?.map(DictionaryNode::Entry)),
        }
    }

    /// The nested dictionary at `prefix`, with or without trailing separator.
    pub fn subdictionary(&self, prefix: &str) -> Result<Self> {
        let (mut segments, name) = self.inner.codec.split(prefix)?;
        segments.extend(name);
        self.descend(&segments)
    }

    // Writes

    pub async fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        let (owner, name) = self.resolve(key)?;
        owner.write(vec![(name, value.into())], Vec::new()).await?;
        owner.link().await
    }

    /// Remove `key`; returns whether it was set.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let (owner, name) = self.resolve(key)?;
        let removed = owner.write(Vec::new(), vec![name]).await? > 0;
        owner.unlink_if_empty().await?;
        Ok(removed)
    }

    /// Set several keys; each indexed dictionary involved commits its index once.
    pub async fn set_many<I, K, V>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bytes>,
    {
        let mut batches: BTreeMap<String, (Self, Vec<(String, Bytes)>)> = BTreeMap::new();
        for (key, value) in items {
            let (owner, name) = self.resolve(key.as_ref())?;
            batches
                .entry(owner.root().to_string())
                .or_insert_with(|| (owner, Vec::new()))
                .1
                .push((name, value.into()));
        }
        for (owner, upserts) in batches.into_values() {
            owner.write(upserts, Vec::new()).await?;
            owner.link().await?;
        }
        Ok(())
    }

    /// Remove several keys; returns how many were set.
    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize> {
        let mut batches: BTreeMap<String, (Self, Vec<String>)> = BTreeMap::new();
        for key in keys {
            let (owner, name) = self.resolve(key.as_ref())?;
            batches
                .entry(owner.root().to_string())
                .or_insert_with(|| (owner, Vec::new()))
                .1
                .push(name);
        }
        let mut removed = 0;
        for (owner, removals) in batches.into_values() {
            removed += owner.write(Vec::new(), removals).await?;
            owner.unlink_if_empty().await?;
        }
        Ok(removed)
    }

    /// Apply upserts and removals at this level; returns how many removed
    /// entries existed.
    async fn write(&self, upserts: Vec<(String, Bytes)>, removals: Vec<String>) -> Result<usize> {
        if self.inner.index.is_some() {
            return self.write_indexed(upserts, removals).await;
        }

        let store = &self.inner.store;
        for (name, value) in upserts {
            let path = self.entry_path(&name)?;
            let token = self.inner.locks.token_for(&path);
            store
                .put(&path, value, PutCondition::None, token.as_ref())
                .await?;
            debug!(path = %path, "Entry written");
        }
        let mut removed = 0;
        for name in removals {
            let path = self.entry_path(&name)?;
            let token = self.inner.locks.token_for(&path);
            if store.delete_if_exists(&path, token.as_ref()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Value blobs are written first under fresh paths, then published by
    /// one index commit; blobs the commit replaced are deleted afterwards.
    async fn write_indexed(
        &self,
        upserts: Vec<(String, Bytes)>,
        removals: Vec<String>,
    ) -> Result<usize> {
        let index = self.index()?;
        for name in upserts.iter().map(|(name, _)| name).chain(&removals) {
            self.check_writable(name).await?;
        }

        let mut mutation = IndexMutation::new();
        let mut written = Vec::with_capacity(upserts.len());
        for (name, value) in upserts {
            let blob = self.blob_path(&name)?;
            match self
                .inner
                .store
                .put(&blob, value, PutCondition::IfNotExists, None)
                .await
            {
                Ok(version) => {
                    let record = IndexRecord::new(name, blob.clone()).with_version(&version);
                    mutation = mutation.upsert(record);
                    written.push(blob);
                }
                Err(e) => {
                    self.discard_blobs(&written).await;
                    return Err(e.into());
                }
            }
        }
        let removed_keys = removals.clone();
        for name in removals {
            mutation = mutation.remove(name);
        }

        let previous = match index.commit(&mutation).await {
            Ok(outcome) => outcome.value,
            Err(e) => {
                self.discard_blobs(&written).await;
                return Err(e);
            }
        };

        let stale: Vec<String> = previous
            .iter()
            .filter(|(key, _)| !self.is_marker(key))
            .map(|(_, record)| record.blob_path.clone())
            .collect();
        self.discard_blobs(&stale).await;
        debug!(root = %self.inner.root, written = written.len(), stale = stale.len(), "Index entries committed");
        Ok(removed_keys.iter().filter(|k| previous.contains_key(*k)).count())
    }

    /// Return the value of `key`, first setting it to `default` when unset.
    ///
    /// Of several callers racing on an unset key exactly one default wins and
    /// every caller gets that value back.
    pub async fn set_default(&self, key: &str, default: impl Into<Bytes>) -> Result<Bytes> {
        let (owner, name) = self.resolve(key)?;
        let value = owner.set_default_entry(&name, default.into()).await?;
        owner.link().await?;
        Ok(value)
    }

    async fn set_default_entry(&self, name: &str, default: Bytes) -> Result<Bytes> {
        if let Some(existing) = self.get_entry(name).await? {
            return Ok(existing);
        }

        let store = &self.inner.store;
        let Some(index) = &self.inner.index else {
            let path = self.entry_path(name)?;
            let token = self.inner.locks.token_for(&path);
            return match store
                .put(&path, default.clone(), PutCondition::IfNotExists, token.as_ref())
                .await
            {
                Ok(_) => Ok(default),
                Err(StoreError::ConditionFailed(_)) => {
                    Ok(self.get_entry(name).await?.unwrap_or(default))
                }
                Err(e) => Err(e.into()),
            };
        };

        self.check_writable(name).await?;
        let blob = self.blob_path(name)?;
        let version = store
            .put(&blob, default.clone(), PutCondition::IfNotExists, None)
            .await?;
        let record = IndexRecord::new(name, blob.clone()).with_version(&version);

        let outcome = index
            .update(|document| match document.get(name) {
                Some(existing) => Ok(Some(existing.clone())),
                None => {
                    document.insert(record.clone());
                    Ok(None)
                }
            })
            .await;
        match outcome {
            Ok(outcome) => match outcome.value {
                None => Ok(default),
                Some(existing) => {
                    self.discard_blobs(&[blob]).await;
                    Ok(store
                        .get_opt(&existing.blob_path)
                        .await?
                        .map(|o| o.data)
                        .unwrap_or(default))
                }
            },
            Err(e) => {
                self.discard_blobs(&[blob]).await;
                Err(e)
            }
        }
    }

    /// Remove every key, descending into sub-dictionaries.
    pub async fn clear(&self) -> Result<()> {
        let mut pending = vec![self.clone()];
        while let Some(dictionary) = pending.pop() {
            pending.extend(dictionary.clear_level().await?);
        }
        self.unlink_if_empty().await?;
        debug!(root = %self.inner.root, "Dictionary cleared");
        Ok(())
    }

    /// Clear this level; returns the sub-dictionaries still to clear.
    async fn clear_level(&self) -> Result<Vec<Self>> {
        let mut children = Vec::new();

        let Some(index) = &self.inner.index else {
            let mut entries = Vec::new();
            for key in self.keys().await? {
                match key.strip_suffix(self.separator()) {
                    Some(segment) => children.push(self.child(segment)?),
                    None => entries.push(key),
                }
            }
            self.write(Vec::new(), entries).await?;
            return Ok(children);
        };

        let (current, _) = index.fetch().await?;
        for key in current.keys().filter(|key| !self.is_marker(key)) {
            self.check_writable(key).await?;
        }

        let outcome = index
            .update(|document| Ok(std::mem::take(&mut document.records)))
            .await?;
        let mut blobs = Vec::new();
        for (key, record) in outcome.value {
            match key.strip_suffix(self.separator()) {
                Some(segment) => children.push(self.child(segment)?),
                None => blobs.push(record.blob_path),
            }
        }
        self.discard_blobs(&blobs).await;
        Ok(children)
    }

    // Entry locks

    /// Lock the entry at `key` for this dictionary, waiting up to `timeout`.
    ///
    /// While held, writes to the entry from any other holder fail with
    /// `NotHolder`. Reads are not affected.
    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<LockHandle> {
        self.lock_with(
            key,
            LockContext::Instance,
            AcquireOptions::new().timeout(timeout),
        )
        .await
    }

    pub async fn lock_with(
        &self,
        key: &str,
        context: LockContext,
        options: AcquireOptions,
    ) -> Result<LockHandle> {
        let (owner, name) = self.resolve(key)?;
        let path = owner.entry_path(&name)?;
        self.inner.locks.acquire_with(&path, context, options).await
    }

    /// Release this dictionary's lock on `key`.
    ///
    /// Fails with `NotHolder` when the entry is locked by someone else and
    /// succeeds when it is not locked at all.
    pub async fn unlock(&self, key: &str) -> Result<()> {
        self.unlock_with(key, &LockContext::Instance).await
    }

    pub async fn unlock_with(&self, key: &str, context: &LockContext) -> Result<()> {
        let (owner, name) = self.resolve(key)?;
        let path = owner.entry_path(&name)?;
        self.inner.locks.release_resource(&path, context).await
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        let (owner, name) = self.resolve(key)?;
        let path = owner.entry_path(&name)?;
        self.inner.locks.is_locked(&path).await
    }
}
