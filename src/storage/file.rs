//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::storage::lock::IndexLock;
use crate::storage::{Storage, StorageError, StorageInput, StorageOutput};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Index directory.
    pub path: PathBuf,

    /// Buffer size for reads and writes.
    pub buffer_size: usize,

    /// Flush to the OS after every write call.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
}

impl FileStorage {
    /// Create a new file storage, creating the directory if needed.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = config.path.clone();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| TesseraError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(TesseraError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Open an existing directory. A missing directory is reported as
    /// [`TesseraError::IndexNotFound`] and is not created.
    pub fn open_existing(config: FileStorageConfig) -> Result<Self> {
        if !config.path.exists() {
            return Err(TesseraError::index_not_found(format!(
                "no index directory at {}",
                config.path.display()
            )));
        }
        Self::new(config)
    }

    /// Open the directory at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(FileStorageConfig::new(path))
    }

    /// The index directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn map_io(name: &str, e: std::io::Error) -> TesseraError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::FileNotFound(name.to_string()).into()
        } else {
            TesseraError::Io(e)
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let file = File::open(self.file_path(name)).map_err(|e| Self::map_io(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TesseraError::Io(e)),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| Self::map_io(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| Self::map_io(old_name, e))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        // Persist renames and unlinks. Not every platform can open a directory.
        #[cfg(unix)]
        {
            File::open(&self.directory)?.sync_all()?;
        }
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Box<dyn IndexLock> {
        Box::new(FileLock::new(self.file_path(name)))
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.delete_file(name)
    }

    fn location(&self) -> String {
        self.directory.display().to_string()
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file.metadata()?.len();
        let reader = BufReader::with_capacity(buffer_size, file);
        Ok(FileInput { reader, size })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        // The file is closed when the BufReader is dropped
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
    closed: bool,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
            closed: false,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.flush_and_sync()?;
            self.closed = true;
        }
        Ok(())
    }
}

/// A lock backed by an exclusively created file.
///
/// The file holds a per-handle owner token so a handle never removes a lock
/// file that was cleared and re-created by someone else.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    name: String,
    token: String,
    held: bool,
}

impl FileLock {
    fn new(path: PathBuf) -> Self {
        FileLock {
            name: path.display().to_string(),
            path,
            token: Uuid::new_v4().to_string(),
            held: false,
        }
    }

    fn owned_by_us(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .map(|content| content.trim() == self.token)
            .unwrap_or(false)
    }
}

impl IndexLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_obtain(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let written = file
                    .write_all(self.token.as_bytes())
                    .and_then(|_| file.sync_all());
                if let Err(e) = written {
                    let _ = std::fs::remove_file(&self.path);
                    return Err(TesseraError::Io(e));
                }
                self.held = true;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(TesseraError::Io(e)),
        }
    }

    fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        if self.owned_by_us() {
            std::fs::remove_file(&self.path)
                .map_err(|e| TesseraError::storage(format!("Failed to release lock: {e}")))?;
        } else {
            warn!("lock {} was cleared by someone else while held", self.name);
        }
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release {} on drop: {e}", self.name);
        }
    }
}
