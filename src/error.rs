//! Error types for Tessera.
//!
//! All fallible operations return [`TesseraError`]. The variants mirror the
//! failure modes callers are expected to handle differently: a missing index,
//! a corrupt commit, lock contention, a stale reader, lifecycle violations,
//! bad document ids, and raw I/O faults.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn example_operation() -> Result<()> {
//!     Err(TesseraError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors raised by a storage backend (including injected faults).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No commit file exists in the directory.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// A commit or generation file failed its checksum or structural checks.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// The directory write lock could not be obtained within the timeout.
    #[error("Lock obtain timed out after {timeout:?}: {lock}")]
    LockObtainFailed { lock: String, timeout: Duration },

    /// The reader's bound generation was superseded; it must be reopened.
    #[error("Stale reader: {0}")]
    StaleReader(String),

    /// The session was used after `close()`.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// A document id outside `[0, max_doc)`.
    #[error("Document {doc} out of range [0, {max_doc})")]
    OutOfRange { doc: u32, max_doc: u32 },

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid argument or configuration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Create a new index-not-found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::IndexNotFound(msg.into())
    }

    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        TesseraError::CorruptIndex(msg.into())
    }

    /// Create a new stale-reader error.
    pub fn stale<S: Into<String>>(msg: S) -> Self {
        TesseraError::StaleReader(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        TesseraError::AlreadyClosed(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Only lock contention qualifies. A stale reader must be reopened instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesseraError::LockObtainFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = TesseraError::corrupt("bad checksum");
        assert_eq!(error.to_string(), "Corrupt index: bad checksum");

        let error = TesseraError::OutOfRange { doc: 11, max_doc: 10 };
        assert_eq!(error.to_string(), "Document 11 out of range [0, 10)");

        let error = TesseraError::LockObtainFailed {
            lock: "/tmp/idx/write.lock".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(error.to_string().contains("/tmp/idx/write.lock"));
        assert!(error.to_string().contains("50ms"));
    }

    #[test]
    fn test_retryable() {
        let lock = TesseraError::LockObtainFailed {
            lock: "write.lock".to_string(),
            timeout: Duration::ZERO,
        };
        assert!(lock.is_retryable());
        assert!(!TesseraError::stale("gen 3 superseded").is_retryable());
        assert!(!TesseraError::already_closed("reader").is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = TesseraError::from(io_error);

        match error {
            TesseraError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }
}
