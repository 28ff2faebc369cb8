//! TinyVault Index: inverted full-text index over a pluggable key-value store
//!
//! The index never touches disk for its rows. Everything goes through the
//! four-part storage contract in [`store`]:
//!
//! - `KvReader` for point, prefix and range reads on a snapshot
//! - `KvIterator` for bounded ordered cursors
//! - `KvWriter` for batched sets, deletes and merges
//! - `MergeOperator` for associative counters
//!
//! [`memory::MemoryStore`] implements the contract in-process; the `tinyvault`
//! crate implements it on top of its encrypted engine.

pub mod analysis;
pub mod error;
pub mod index;
pub mod mapping;
pub mod memory;
pub mod merge;
pub mod query;
pub mod rows;
pub mod store;

pub use analysis::Analyzer;
pub use error::{IndexError, IndexResult, StoreError};
pub use index::SearchIndex;
pub use mapping::{FieldMapping, IndexMapping};
pub use memory::{MemoryOpener, MemoryStore};
pub use merge::CountMergeOperator;
pub use query::{Query, SearchHit, SearchRequest, SearchResult};
pub use store::{
    BatchOp, BatchOptions, KeyBounds, KvBatch, KvIterator, KvReader, KvStore, KvStoreOpener,
    KvWriter, MergeOperator, Merges,
};
