//! Error types for engine operations
//!
//! Every failure the engine can report is an [`EngineError`]. Variants carry
//! enough context (paths, offsets, sizes) to diagnose a corrupted log or a
//! rejected batch without a debugger. The type is `Clone` so the outcome of a
//! shared commit can be handed to every participant.

use std::path::PathBuf;

use thiserror::Error;

/// Engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A log or checkpoint file is corrupted and cannot be read past this point
    #[error("corrupted file {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Partial write at end of file
    #[error(
        "torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available",
        .path.display()
    )]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error(
        "magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
        .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3]
    )]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Key or value exceeds the configured maximum
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        /// `"key"` or `"value"`
        component: &'static str,
    },

    /// Keys must be non-empty
    #[error("empty key in write batch")]
    EmptyKey,

    /// Too many mutations in a single commit
    #[error("write batch holds {ops} mutations, limit is {max_ops}")]
    BatchTooLarge { ops: usize, max_ops: usize },

    /// Ciphertext failed authentication (wrong key, wrong record key or tampering)
    #[error("decryption failed for record key of {key_len} bytes")]
    Decryption { key_len: usize },

    /// Encryption could not be performed
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Configuration rejected by `validate()`
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Operation attempted after `close()`
    #[error("engine is closed")]
    Closed,
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl EngineError {
    /// Attach a path and a description to an I/O error.
    pub(crate) fn io(path: impl Into<PathBuf>, what: &str, err: std::io::Error) -> Self {
        EngineError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.wal"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = err.to_string();
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();

        match err {
            EngineError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_display_with_and_without_path() {
        let with = EngineError::io(
            "/data/wal",
            "open",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(with.to_string().contains("/data/wal"));

        let without: EngineError =
            std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(without.to_string().starts_with("I/O error: boom"));
    }
}
