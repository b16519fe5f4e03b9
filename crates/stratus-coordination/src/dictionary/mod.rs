//! Remote key-value dictionaries
//!
//! Two flavours share one API. An indexed dictionary keeps every key in a
//! single index object guarded by [`IndexManager`](crate::index::IndexManager),
//! which makes enumeration cheap and consistent. A non-indexed dictionary
//! maps each key straight to a store path, so writers never contend and
//! enumeration is an eventually consistent prefix listing.

mod key_codec;
mod node;
mod remote;

pub use key_codec::KeyCodec;
pub use node::{DictionaryKind, DictionaryNode};
pub use remote::RemoteDictionary;
