//! TinyVault Core: ordered multi-version key-value engine
//!
//! RAM holds every key's version chain; a write-ahead log makes commits
//! durable and checkpoints keep the log short.
//!
//! # Architecture
//!
//! - **Commits**: atomic batches split into version groups, WAL-first
//! - **Reads**: snapshots pinned at a committed version, never blocked by
//!   commits for longer than one map update
//! - **History**: all-versions iteration bounded by `versions_to_keep` and
//!   by discard-earlier markers
//! - **GC**: background pruning plus checkpoints
//! - **Cipher**: record-bound XChaCha20-Poly1305 for callers that store
//!   ciphertext
//!
//! The engine knows nothing about documents, indexes or encryption policy.
//! Those live in the `tinyvault` crate.

pub mod batch;
pub mod checkpoint;
pub mod cipher;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod format;
pub mod gc;
pub mod iter;
pub mod txn;
pub mod version;
pub mod wal;

pub use batch::{CommitInfo, Mutation, WriteBatch};
pub use cipher::Cipher;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use gc::{GcReport, GcStats};
pub use iter::{EngineIter, IterOptions};
pub use txn::{Item, ReadTxn};
