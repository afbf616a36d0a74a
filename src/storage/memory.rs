//! In-memory storage implementation for testing and caching.
//!
//! Clones of the `Arc` handing out a [`MemoryStorage`] share both the file map
//! and the lock table, so independent sessions in one process contend for the
//! write lock exactly as they would on disk.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use log::warn;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::lock::IndexLock;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

type FileMap = Arc<Mutex<AHashMap<String, Arc<[u8]>>>>;
type LockTable = Arc<Mutex<AHashMap<String, Uuid>>>;

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file map.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

/// An in-memory storage implementation.
#[derive(Debug)]
pub struct MemoryStorage {
    /// Published files. Outputs become visible here on close.
    files: FileMap,
    /// Lock owners keyed by lock name.
    locks: LockTable,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(AHashMap::with_capacity(config.initial_capacity))),
            locks: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Overwrite a file's bytes in place. Tests use this to simulate
    /// on-disk corruption.
    pub fn corrupt_file(&self, name: &str, offset: usize) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let mut bytes = data.to_vec();
        if let Some(byte) = bytes.get_mut(offset) {
            *byte ^= 0xFF;
        }
        files.insert(name.to_string(), Arc::from(bytes));
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn size_in_bytes(&self) -> Result<u64> {
        let files = self.files.lock();
        Ok(files.values().map(|data| data.len() as u64).sum())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Box<dyn IndexLock> {
        Box::new(MemoryLock {
            name: format!("memory:{name}"),
            key: name.to_string(),
            owner: Uuid::new_v4(),
            locks: Arc::clone(&self.locks),
            held: false,
        })
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.locks.lock().remove(name);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // An abandoned output leaves whatever was written, like a torn file on disk.
        let _ = self.close();
    }
}

/// A lock entry in a [`MemoryStorage`] lock table.
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    key: String,
    owner: Uuid,
    locks: LockTable,
    held: bool,
}

impl IndexLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        let mut locks = self.locks.lock();
        if locks.contains_key(&self.key) {
            return Ok(false);
        }
        locks.insert(self.key.clone(), self.owner);
        self.held = true;
        Ok(true)
    }

    fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        let mut locks = self.locks.lock();
        match locks.get(&self.key) {
            Some(owner) if *owner == self.owner => {
                locks.remove(&self.key);
            }
            _ => warn!("lock {} was cleared by someone else while held", self.name),
        }
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.locks.lock().contains_key(&self.key))
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::lock::WRITE_LOCK_NAME;

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("test.bin").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.size_in_bytes().unwrap(), 14);
    }

    #[test]
    fn test_output_invisible_until_close() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("pending").unwrap();
        output.write_all(b"abc").unwrap();
        assert!(!storage.file_exists("pending"));
        output.close().unwrap();
        assert!(storage.file_exists("pending"));
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"Test content").unwrap();
        output.close().unwrap();

        assert_eq!(storage.file_size("test.bin").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["test.bin"]);

        storage.rename_file("test.bin", "renamed.bin").unwrap();
        assert!(!storage.file_exists("test.bin"));
        assert!(storage.file_exists("renamed.bin"));

        storage.delete_file("renamed.bin").unwrap();
        storage.delete_file("renamed.bin").unwrap();
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_corrupt_file() {
        let storage = MemoryStorage::new_default();
        let mut output = storage.create_output("f").unwrap();
        output.write_all(&[1, 2, 3]).unwrap();
        output.close().unwrap();

        storage.corrupt_file("f", 1).unwrap();
        assert_eq!(crate::storage::read_all(&storage, "f").unwrap(), vec![1, 0xFD, 3]);
    }

    #[test]
    fn test_lock_table_is_shared() {
        let storage = MemoryStorage::new_default();

        let mut first = storage.make_lock(WRITE_LOCK_NAME);
        let mut second = storage.make_lock(WRITE_LOCK_NAME);
        assert!(first.try_obtain().unwrap());
        assert!(!second.try_obtain().unwrap());

        drop(first);
        assert!(!second.is_locked().unwrap());
        assert!(second.try_obtain().unwrap());

        storage.clear_lock(WRITE_LOCK_NAME).unwrap();
        assert!(!second.is_locked().unwrap());
        // Releasing after a forced clear is a no-op.
        second.release().unwrap();
    }
}
