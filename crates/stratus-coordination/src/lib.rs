//! Stratus coordination primitives
//!
//! This crate provides, on top of any [`StoreAdapter`](stratus_store::StoreAdapter):
//! - A distributed lock with instance, application and custom scopes
//! - An at-least-once queue with visibility leases
//! - An index object kept consistent under concurrent writers
//! - Indexed and non-indexed remote dictionaries
//!
//! [`Coordinator`] wires them to one store and configuration.

pub mod coordinator;
pub mod dictionary;
pub mod index;
pub mod lock;
pub mod queue;
pub mod store_client;

pub use coordinator::Coordinator;
pub use dictionary::{DictionaryKind, DictionaryNode, KeyCodec, RemoteDictionary};
pub use index::{IndexDocument, IndexManager, IndexMutation, IndexRecord, UpdateOutcome};
pub use lock::{AcquireOptions, LockContext, LockHandle, LockManager, LockStats};
pub use queue::{MessageGuard, OnError, PopOptions, QueueMessage, RemoteQueue, WaitTime};
pub use store_client::StoreClient;

pub use stratus_common::{CancellationToken, Result, StratusConfig, StratusError};
