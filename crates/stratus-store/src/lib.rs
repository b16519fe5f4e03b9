//! Storage seam for Stratus
//!
//! [`StoreAdapter`] is the only way coordination primitives talk to the
//! remote store. [`MemoryStore`] is the in-process reference adapter.

pub mod adapter;
pub mod error;
pub mod memory;
pub mod model;

pub use adapter::StoreAdapter;
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryStoreOptions};
pub use model::{
    LeaseInfo, LeaseToken, PutCondition, ReceiptHandle, ReceivedMessage, StoredObject,
    VersionToken,
};
