//! Wire types exchanged with a store adapter

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque version of a stored object, changes on every successful write
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of holding the lease on `path`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub path: String,
    pub lease_id: String,
}

impl LeaseToken {
    pub fn new(path: impl Into<String>, lease_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lease_id: lease_id.into(),
        }
    }
}

/// Read-only view of the live lease on a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Time left before the lease lapses
    pub expires_in: Duration,
}

impl LeaseInfo {
    pub fn is_held_by(&self, token: &LeaseToken) -> bool {
        self.lease_id == token.lease_id
    }
}

/// Object body plus the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub version: VersionToken,
}

/// Precondition attached to a `put`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite
    #[default]
    None,
    /// Create only; fails if the path exists
    IfNotExists,
    /// Overwrite only if the current version matches
    IfMatch(VersionToken),
}

/// Handle needed to update or delete a received message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    pub queue: String,
    pub message_id: String,
    /// Changes on every receive and visibility update
    pub pop_receipt: String,
}

/// A message handed out by `queue_receive`
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub payload: Bytes,
    pub receipt: ReceiptHandle,
    pub enqueue_time: DateTime<Utc>,
    pub visible_until: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,
}
