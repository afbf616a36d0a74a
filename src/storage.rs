//! Storage abstraction layer for Tessera.
//!
//! An index directory is a flat namespace of named blobs. Everything above
//! this layer (commits, generation files, the file deleter) talks to a
//! [`Storage`] trait object, so the same protocol runs against a real
//! directory, an in-memory map, or a fault-injecting wrapper in tests.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - Lock implemented as an exclusively created lock file
//!
//! ## MemoryStorage
//! - In-memory storage for testing and temporary data
//! - Lock table shared by every handle to the same instance
//!
//! ## FaultInjectingStorage
//! - Wraps another storage with a disk-size limit, random I/O faults and
//!   targeted delete failures
//!
//! # Example
//!
//! ```
//! use tessera::storage::{StorageConfig, StorageFactory};
//! use tessera::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! assert!(storage.list_files()?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{Result, TesseraError};

pub mod fault;
pub mod file;
pub mod lock;
pub mod memory;
pub mod structured;

pub use lock::{IndexLock, LockRetryPolicy};

/// A trait for storage backends holding the files of one index directory.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    ///
    /// Data becomes visible under `name` no later than `close()` on the output.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a file that does not exist succeeds.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename `old_name` to `new_name`, replacing any existing target.
    ///
    /// This is the publication primitive: write under a temporary name, sync,
    /// then rename so readers never observe partial content.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Total size of all files in bytes.
    fn size_in_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for name in self.list_files()? {
            match self.file_size(&name) {
                Ok(size) => total += size,
                // Raced with a concurrent delete.
                Err(_) if !self.file_exists(&name) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Sync directory-level metadata (renames, deletes) to durable storage.
    fn sync(&self) -> Result<()>;

    /// Create a lock handle for `name`. The lock is not obtained yet.
    fn make_lock(&self, name: &str) -> Box<dyn IndexLock>;

    /// Forcefully remove the lock `name`, whoever holds it.
    ///
    /// This is an administrative escape hatch. Calling it while a writer is
    /// genuinely active breaks mutual exclusion and can corrupt the index.
    fn clear_lock(&self, name: &str) -> Result<()>;

    /// A human-readable location of this storage, used in error messages.
    fn location(&self) -> String;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush buffered data and sync it to durable storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, syncing it first.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut buffer = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut buffer)?;
    input.close()?;
    Ok(buffer)
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let storage = file::FileStorage::new(file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Invalid operation.
    InvalidOperation(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for TesseraError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => TesseraError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {name}"),
            )),
            other => TesseraError::storage(other.to_string()),
        }
    }
}

/// Whether `err` reports a missing file.
pub fn is_not_found(err: &TesseraError) -> bool {
    matches!(err, TesseraError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("segments_1".to_string());
        assert_eq!(err.to_string(), "File not found: segments_1");

        let err = StorageError::IoError("connection failed".to_string());
        assert_eq!(err.to_string(), "I/O error: connection failed");
    }

    #[test]
    fn test_not_found_maps_to_io() {
        let err: TesseraError = StorageError::FileNotFound("x".to_string()).into();
        assert!(is_not_found(&err));

        let err: TesseraError = StorageError::IoError("boom".to_string()).into();
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_storage_factory_memory() {
        let config = StorageConfig::Memory(MemoryStorageConfig::default());
        let storage = StorageFactory::create(config).unwrap();
        assert!(!storage.file_exists("segments_1"));
    }

    #[test]
    fn test_storage_factory_file_and_size() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::File(FileStorageConfig::new(temp_dir.path()));
        let storage = StorageFactory::create(config).unwrap();

        let mut output = storage.create_output("a.bin").unwrap();
        output.write_all(b"12345").unwrap();
        output.close().unwrap();
        let mut output = storage.create_output("b.bin").unwrap();
        output.write_all(b"678").unwrap();
        output.close().unwrap();

        assert_eq!(storage.size_in_bytes().unwrap(), 8);
        assert_eq!(read_all(storage.as_ref(), "b.bin").unwrap(), b"678");
    }
}
