//! TinyVault: embedded encrypted document store
//!
//! Documents, full-text index rows and file chunks share one encrypted,
//! multi-version key space in the `tinyvault-core` engine.
//!
//! # Architecture
//!
//! - **Write coordinator**: a single writer thread merges concurrent
//!   transactions into one atomic engine commit per batch, encrypting every
//!   payload with its target key as associated data
//! - **Index storage**: `tinyvault-index` persists its rows through an
//!   adapter whose writer submits to the same coordinator, so documents and
//!   postings are ordered by one authority
//! - **Collections**: one key prefix each, versioned documents with history
//!   and rollback, indexes attached and backfilled on demand
//! - **Files**: fixed-size chunks under a hashed id, one writer at a time
//!
//! Key layout lives in [`keys`].

pub mod adapter;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod files;
pub mod index;
pub mod keys;
mod registry;
pub mod transaction;

pub use collection::{Collection, Revision};
pub use config::DbConfig;
pub use coordinator::{BatchLimits, CoordinatorHandle, CoordinatorStats, WriteCoordinator};
pub use db::Db;
pub use error::{DbError, DbResult};
pub use files::{FileMeta, FileReader, FileWriter};
pub use index::IndexDescriptor;
pub use transaction::{Operation, Transaction, WriteContext};

pub use tinyvault_index::{
    Analyzer, FieldMapping, IndexMapping, Query, SearchHit, SearchRequest, SearchResult,
};
