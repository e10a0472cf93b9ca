//! Error types for stashmap operations
//!
//! All stashmap errors are represented by the StoreError enum. The taxonomy
//! is deliberately small: I/O failures propagate with file context, structural
//! damage found while opening or reading persisted state is reported as a
//! distinct corruption kind (callers can decide to delete and rebuild), and
//! touching a closed map gets its own variant.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Stashmap error types with file-level context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Persisted structure is damaged and cannot be restored
    Corrupted {
        /// Path to the damaged file
        path: PathBuf,
        /// Description of what failed to parse
        reason: String,
    },

    /// A value log chunk failed structural validation
    LogCorrupted {
        /// Path to the value log file
        path: PathBuf,
        /// Byte offset of the bad chunk
        offset: u64,
        /// Description of the violation
        reason: String,
    },

    /// Checksum verification failed on a value log chunk
    ChecksumMismatch {
        /// File where the checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted chunk
        offset: u64,
    },

    /// Operation attempted on a map that has been closed
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::Corrupted { path, reason } => {
                write!(f, "Corrupted storage in {}: {}", path.display(), reason)
            }

            StoreError::LogCorrupted { path, offset, reason } => {
                write!(f, "Value log corrupted in {} at offset {}: {}", path.display(), offset, reason)
            }

            StoreError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(f, "Checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), offset, expected, actual)
            }

            StoreError::Closed => {
                write!(f, "Map is closed")
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for stashmap operations
pub type StoreResult<T> = Result<T, StoreError>;
