//! Shared index object with optimistic concurrency

mod manager;
mod model;

pub use manager::{IndexManager, UpdateOutcome};
pub use model::{INDEX_FORMAT_VERSION, IndexDocument, IndexMutation, IndexRecord};
