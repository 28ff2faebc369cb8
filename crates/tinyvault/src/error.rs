//! Error types for database operations

use thiserror::Error;
use tinyvault_core::EngineError;
use tinyvault_index::IndexError;

#[derive(Debug, Error)]
pub enum DbError {
    /// Record absent, deleted, or file unknown
    #[error("not found: {0}")]
    NotFound(String),

    #[error("id must not be empty")]
    EmptyId,

    #[error("collection {0:?} already exists")]
    CollectionExists(String),

    #[error("collection {0:?} not found")]
    CollectionNotFound(String),

    /// Every collection prefix is in use
    #[error("no free collection prefix left ({in_use} collections)")]
    CollectionLimit { in_use: usize },

    #[error("index {name:?} already exists on collection {collection:?}")]
    IndexNameExists { collection: String, name: String },

    #[error("index {name:?} not found on collection {collection:?}")]
    IndexNotFound { collection: String, name: String },

    /// Two index names hash to the same prefix inside one collection
    #[error("index {name:?} collides with index {existing:?} on prefix {prefix:02x?}")]
    HashCollision { name: String, existing: String, prefix: Vec<u8> },

    #[error("put_multi got {ids} ids but {contents} contents")]
    PutMultiLength { ids: usize, contents: usize },

    /// Rollback asked for a version deeper than history holds
    #[error("version {requested} of {id:?} not found ({available} older versions retained)")]
    VersionNotFound { id: String, requested: usize, available: usize },

    #[error("file {0:?} already has an open writer")]
    FileInWrite(String),

    #[error("offset {offset} is past the end of file {id:?} ({size} bytes)")]
    OffsetOutOfRange { id: String, offset: u64, size: u64 },

    #[error("database is closed")]
    Closed,

    #[error("transaction timed out")]
    Timeout,

    #[error("transaction cancelled")]
    Cancelled,

    /// Ciphertext did not authenticate under its key
    #[error("decryption failed for a record of {key_len}-byte key")]
    Decryption { key_len: usize },

    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Index(IndexError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<EngineError> for DbError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Decryption { key_len } => DbError::Decryption { key_len },
            EngineError::Closed => DbError::Closed,
            other => DbError::Engine(other),
        }
    }
}

impl From<IndexError> for DbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Closed => DbError::Closed,
            IndexError::Timeout => DbError::Timeout,
            // The adapter boxes our own errors on the way through the index
            IndexError::Store(inner) => match inner.downcast::<DbError>() {
                Ok(db) => *db,
                Err(other) => DbError::Index(IndexError::Store(other)),
            },
            other => DbError::Index(other),
        }
    }
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;
