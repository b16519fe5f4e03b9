use bytes::Bytes;

use super::remote::RemoteDictionary;

/// How a dictionary tracks its keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DictionaryKind {
    /// Keys live in a shared index object; enumeration is one index read
    #[default]
    Indexed,
    /// Keys map directly to store paths; enumeration is a prefix listing
    NonIndexed,
}

impl std::fmt::Display for DictionaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DictionaryKind::Indexed => write!(f, "indexed"),
            DictionaryKind::NonIndexed => write!(f, "non-indexed"),
        }
    }
}

/// What a key resolves to
#[derive(Debug, Clone)]
pub enum DictionaryNode {
    Entry(Bytes),
    SubDictionary(RemoteDictionary),
}

impl DictionaryNode {
    pub fn is_entry(&self) -> bool {
        matches!(self, DictionaryNode::Entry(_))
    }

    pub fn as_entry(&self) -> Option<&Bytes> {
        match self {
            DictionaryNode::Entry(value) => Some(value),
            DictionaryNode::SubDictionary(_) => None,
        }
    }

    pub fn into_subdictionary(self) -> Option<RemoteDictionary> {
        match self {
            DictionaryNode::SubDictionary(dictionary) => Some(dictionary),
            DictionaryNode::Entry(_) => None,
        }
    }
}
