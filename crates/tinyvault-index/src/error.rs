//! Error types for index operations

use std::path::PathBuf;

use thiserror::Error;

/// Boxed error coming from a storage backend.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum IndexError {
    /// The backing store failed; the source is the backend's own error
    #[error("index store error: {0}")]
    Store(#[source] StoreError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("index already exists at {}", .0.display())]
    PathExists(PathBuf),

    #[error("no index metadata at {}", .0.display())]
    MetaMissing(PathBuf),

    #[error("merge operator {operator} produced no value for a key of {key_len} bytes")]
    MergeFailed { operator: &'static str, key_len: usize },

    #[error("index format version {found} is not supported (expected {expected})")]
    IncompatibleVersion { found: u8, expected: u8 },

    #[error("corrupt index row: {0}")]
    CorruptRow(String),

    #[error("document id must not be empty")]
    EmptyId,

    #[error("search exceeded its timeout")]
    Timeout,

    #[error("index is closed")]
    Closed,
}

impl IndexError {
    /// Wrap any backend error.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        IndexError::Store(Box::new(err))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io { path: path.into(), source }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
