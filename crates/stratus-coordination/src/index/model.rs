use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stratus_common::Result;
use stratus_store::VersionToken;

/// Current layout of the serialized index object
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Where the current value of one key lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: String,
    pub blob_path: String,
    /// Version of the blob when the record was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
}

impl IndexRecord {
    pub fn new(key: impl Into<String>, blob_path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            blob_path: blob_path.into(),
            version_token: None,
        }
    }

    pub fn with_version(mut self, version: &VersionToken) -> Self {
        self.version_token = Some(version.as_str().to_string());
        self
    }
}

/// The index object: every key of a dictionary mapped to its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default = "default_format")]
    pub format: u32,
    #[serde(default)]
    pub records: BTreeMap<String, IndexRecord>,
}

fn default_format() -> u32 {
    INDEX_FORMAT_VERSION
}

impl Default for IndexDocument {
    fn default() -> Self {
        Self {
            format: INDEX_FORMAT_VERSION,
            records: BTreeMap::new(),
        }
    }
}

impl IndexDocument {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn get(&self, key: &str) -> Option<&IndexRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Returns the record it replaced.
    pub fn insert(&mut self, record: IndexRecord) -> Option<IndexRecord> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexRecord> {
        self.records.remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &IndexRecord> {
        self.records.values()
    }
}

/// A caller's change to the index, re-applied to the latest document on
/// every commit attempt.
///
/// The last call for a key wins: `upsert` after `remove` keeps the upsert
/// and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMutation {
    upserts: BTreeMap<String, IndexRecord>,
    removals: BTreeSet<String>,
}

impl IndexMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, record: IndexRecord) -> Self {
        self.removals.remove(&record.key);
        self.upserts.insert(record.key.clone(), record);
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.upserts.remove(&key);
        self.removals.insert(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn upserts(&self) -> impl Iterator<Item = &IndexRecord> {
        self.upserts.values()
    }

    pub fn removals(&self) -> impl Iterator<Item = &str> {
        self.removals.iter().map(String::as_str)
    }

    /// Apply to `document`, returning the records that were replaced or
    /// removed, keyed by key.
    pub fn apply(&self, document: &mut IndexDocument) -> BTreeMap<String, IndexRecord> {
        let mut previous = BTreeMap::new();
        for key in &self.removals {
            if let Some(old) = document.remove(key) {
                previous.insert(key.clone(), old);
            }
        }
        for record in self.upserts.values() {
            if let Some(old) = document.insert(record.clone())
                && old != *record
            {
                previous.insert(record.key.clone(), old);
            }
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_document_json_layout() {
        let mut doc = IndexDocument::default();
        doc.insert(IndexRecord::new("a", "root/__data__/a.1"));

        let bytes = doc.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["format"], 1);
        assert_eq!(json["records"]["a"]["blob_path"], "root/__data__/a.1");
        assert!(json["records"]["a"].get("version_token").is_none());

        assert_eq!(IndexDocument::from_bytes(&bytes).unwrap(), doc);
    }

    #[test]
    fn test_document_tolerates_missing_fields() {
        let doc = IndexDocument::from_bytes(b"{}").unwrap();
        assert_eq!(doc.format, INDEX_FORMAT_VERSION);
        assert!(doc.is_empty());
        assert!(IndexDocument::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_mutation_last_call_wins() {
        let mutation = IndexMutation::new()
            .remove("a")
            .upsert(IndexRecord::new("a", "p1"))
            .upsert(IndexRecord::new("b", "p2"))
            .remove("b");
        assert_eq!(mutation.upserts().count(), 1);
        assert_eq!(mutation.removals().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_apply_reports_previous_records() {
        let mut doc = IndexDocument::default();
        doc.insert(IndexRecord::new("a", "old-a"));
        doc.insert(IndexRecord::new("b", "old-b"));
        doc.insert(IndexRecord::new("c", "same-c"));

        let previous = IndexMutation::new()
            .upsert(IndexRecord::new("a", "new-a"))
            .upsert(IndexRecord::new("c", "same-c"))
            .remove("b")
            .remove("missing")
            .apply(&mut doc);

        assert_eq!(previous.len(), 2);
        assert_eq!(previous["a"].blob_path, "old-a");
        assert_eq!(previous["b"].blob_path, "old-b");
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    fn arb_mutation() -> impl Strategy<Value = IndexMutation> {
        prop::collection::vec((0u8..8, any::<bool>()), 0..12).prop_map(|ops| {
            ops.into_iter()
                .fold(IndexMutation::new(), |mutation, (key, upsert)| {
                    let key = format!("k{}", key);
                    if upsert {
                        let path = format!("blob/{}", key);
                        mutation.upsert(IndexRecord::new(key, path))
                    } else {
                        mutation.remove(key)
                    }
                })
        })
    }

    fn arb_document() -> impl Strategy<Value = IndexDocument> {
        prop::collection::btree_set(0u8..12, 0..10).prop_map(|keys| {
            let mut doc = IndexDocument::default();
            for key in keys {
                doc.insert(IndexRecord::new(format!("k{}", key), format!("other/{}", key)));
            }
            doc
        })
    }

    proptest! {
        #[test]
        fn prop_apply_is_idempotent(mutation in arb_mutation(), doc in arb_document()) {
            let mut once = doc.clone();
            mutation.apply(&mut once);
            let mut twice = once.clone();
            let previous = mutation.apply(&mut twice);
            prop_assert_eq!(once, twice);
            prop_assert!(previous.is_empty());
        }

        #[test]
        fn prop_apply_leaves_other_keys_alone(mutation in arb_mutation(), doc in arb_document()) {
            let mut applied = doc.clone();
            mutation.apply(&mut applied);

            for (key, record) in &doc.records {
                let touched = mutation.upserts().any(|r| &r.key == key)
                    || mutation.removals().any(|k| k == key);
                if !touched {
                    prop_assert_eq!(applied.get(key), Some(record));
                }
            }
            for record in mutation.upserts() {
                prop_assert_eq!(applied.get(&record.key), Some(record));
            }
            for key in mutation.removals() {
                prop_assert!(!applied.contains(key));
            }
        }
    }
}
