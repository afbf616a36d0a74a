//! Index handle and coordination.
//!
//! An [`Index`] bundles the storage, the configuration and the [`FileRefs`]
//! table shared by every session it opens. Sessions opened through the same
//! handle protect each other's files from the deleter; sessions in other
//! processes only see the latest commit and are not protected.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::config::{IndexConfig, OpenMode};
use crate::error::Result;
use crate::index::check::{CheckReport, check_index};
use crate::index::commit::CommitDescriptor;
use crate::index::deleter::{DeleterReport, FileDeleter, FileRefs};
use crate::index::reader::IndexReader;
use crate::index::writer::IndexWriter;
use crate::storage::Storage;
use crate::storage::file::{FileStorage, FileStorageConfig};
use crate::storage::lock::WRITE_LOCK_NAME;
use crate::storage::memory::MemoryStorage;

/// Statistics about the latest commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub version: u64,

    /// Live documents.
    pub doc_count: u64,

    /// Deleted documents not yet merged away.
    pub deleted_count: u64,

    pub segment_count: usize,

    /// Total size of the index directory in bytes.
    pub total_size: u64,

    pub last_modified: Option<DateTime<Utc>>,
}

/// Entry point to an index stored in one directory.
#[derive(Debug, Clone)]
pub struct Index {
    storage: Arc<dyn Storage>,
    refs: FileRefs,
    config: IndexConfig,
}

impl Index {
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Index {
            storage,
            refs: FileRefs::new(),
            config,
        })
    }

    /// Open the index in directory `dir`, creating the directory if needed.
    pub fn open_dir<P: AsRef<Path>>(dir: P, config: IndexConfig) -> Result<Self> {
        let storage = FileStorage::open(dir)?;
        Index::open(Arc::new(storage), config)
    }

    /// Open the index in the existing directory `dir`. Never creates the
    /// directory.
    pub fn open_existing_dir<P: AsRef<Path>>(dir: P, config: IndexConfig) -> Result<Self> {
        let storage = FileStorage::open_existing(FileStorageConfig::new(dir))?;
        Index::open(Arc::new(storage), config)
    }

    pub fn in_memory(config: IndexConfig) -> Result<Self> {
        Index::open(Arc::new(MemoryStorage::new_default()), config)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn refs(&self) -> &FileRefs {
        &self.refs
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Whether any commit file is present.
    pub fn exists(&self) -> Result<bool> {
        Ok(CommitDescriptor::latest_generation(self.storage.as_ref())?.is_some())
    }

    pub fn writer(&self) -> Result<IndexWriter> {
        IndexWriter::open(Arc::clone(&self.storage), self.refs.clone(), self.config.clone())
    }

    pub fn writer_with_mode(&self, open_mode: OpenMode) -> Result<IndexWriter> {
        IndexWriter::open(
            Arc::clone(&self.storage),
            self.refs.clone(),
            self.config.clone().with_open_mode(open_mode),
        )
    }

    pub fn reader(&self) -> Result<IndexReader> {
        IndexReader::open(Arc::clone(&self.storage), self.refs.clone(), self.config.clone())
    }

    pub fn latest_commit(&self) -> Result<CommitDescriptor> {
        CommitDescriptor::read(self.storage.as_ref())
    }

    /// Every readable commit still present, oldest first.
    pub fn commits(&self) -> Result<Vec<CommitDescriptor>> {
        CommitDescriptor::list_commits(self.storage.as_ref())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let commit = self.latest_commit()?;
        Ok(IndexStats {
            generation: commit.generation,
            version: commit.version,
            doc_count: commit.num_docs(),
            deleted_count: commit.max_doc() - commit.num_docs(),
            segment_count: commit.segments.len(),
            total_size: self.storage.size_in_bytes()?,
            last_modified: commit.timestamp(),
        })
    }

    pub fn is_locked(&self) -> Result<bool> {
        IndexWriter::is_locked(self.storage.as_ref())
    }

    /// Forcibly remove the write lock. See [`IndexWriter::unlock`].
    pub fn unlock(&self) -> Result<()> {
        IndexWriter::unlock(self.storage.as_ref())
    }

    /// Index files a deleter pass would remove now. Takes no lock.
    pub fn unreferenced_files(&self) -> Result<Vec<String>> {
        let commit = self.latest_commit()?;
        let (deletable, _) = FileDeleter::new(self.storage.as_ref(), &self.refs).plan(&commit)?;
        Ok(deletable)
    }

    /// Run a deleter pass against the latest commit under the write lock.
    pub fn collect_garbage(&self) -> Result<DeleterReport> {
        let mut lock = self.storage.make_lock(WRITE_LOCK_NAME);
        lock.obtain(&self.config.lock.retry_policy())?;

        let report = self
            .latest_commit()
            .and_then(|commit| FileDeleter::new(self.storage.as_ref(), &self.refs).run(&commit));
        let released = lock.release();

        let report = report?;
        released?;
        info!(
            "garbage collection removed {} files ({} failed)",
            report.deleted.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Verify the latest commit and every file it references.
    pub fn check(&self) -> Result<CheckReport> {
        check_index(self.storage.as_ref())
    }
}
