//! Reference-counted reclamation of index files.
//!
//! [`FileRefs`] is a table `file name -> count` shared by every session opened
//! through one [`crate::index::Index`]. A session increments the counts of all
//! files of the commit it binds and decrements them when it lets go. A
//! [`FileDeleter`] pass deletes every index file that is neither referenced by
//! the just-committed descriptor nor counted in the table.
//!
//! Passes are only run by the holder of the directory write lock, so they
//! never race with another actor writing new, not yet committed files.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::index::commit::CommitDescriptor;
use crate::index::file_names::{self, COMMIT_POINTER};
use crate::storage::Storage;
use crate::storage::lock::WRITE_LOCK_NAME;

/// Shared reference counts of index files held by open sessions.
#[derive(Debug, Clone, Default)]
pub struct FileRefs {
    counts: Arc<Mutex<AHashMap<String, usize>>>,
}

impl FileRefs {
    pub fn new() -> Self {
        FileRefs::default()
    }

    /// Add one reference to each file.
    pub fn inc_ref(&self, files: &[String]) {
        let mut counts = self.counts.lock();
        for file in files {
            *counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    /// Drop one reference from each file.
    pub fn dec_ref(&self, files: &[String]) {
        let mut counts = self.counts.lock();
        for file in files {
            match counts.get_mut(file) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(file);
                }
                None => warn!("dec_ref of unreferenced file {file}"),
            }
        }
    }

    pub fn count(&self, file: &str) -> usize {
        self.counts.lock().get(file).copied().unwrap_or(0)
    }

    /// Files with a positive count.
    pub fn referenced(&self) -> BTreeSet<String> {
        self.counts.lock().keys().cloned().collect()
    }
}

/// Outcome of one deleter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleterReport {
    /// Files removed.
    pub deleted: Vec<String>,
    /// Files whose deletion failed; a later pass retries them.
    pub failed: Vec<String>,
    /// Index files kept because something references them.
    pub retained: usize,
}

/// Deletes unreferenced index files.
#[derive(Debug)]
pub struct FileDeleter<'a> {
    storage: &'a dyn Storage,
    refs: &'a FileRefs,
}

impl<'a> FileDeleter<'a> {
    pub fn new(storage: &'a dyn Storage, refs: &'a FileRefs) -> Self {
        FileDeleter { storage, refs }
    }

    /// Index files a pass relative to `committed` would delete.
    pub fn plan(&self, committed: &CommitDescriptor) -> Result<(Vec<String>, usize)> {
        let mut protected: BTreeSet<String> = committed.files(true).into_iter().collect();
        protected.extend(self.refs.referenced());
        protected.insert(COMMIT_POINTER.to_string());
        protected.insert(WRITE_LOCK_NAME.to_string());

        let mut deletable = Vec::new();
        let mut retained = 0;
        for name in self.storage.list_files()? {
            if !file_names::is_index_file(&name) {
                continue;
            }
            if protected.contains(&name) {
                retained += 1;
            } else {
                deletable.push(name);
            }
        }
        Ok((deletable, retained))
    }

    /// Delete every unreferenced index file.
    ///
    /// Individual delete failures are logged and reported, never returned;
    /// only a failure to list the directory fails the pass.
    pub fn run(&self, committed: &CommitDescriptor) -> Result<DeleterReport> {
        let (deletable, retained) = self.plan(committed)?;
        let mut report = DeleterReport {
            retained,
            ..DeleterReport::default()
        };

        for name in deletable {
            match self.storage.delete_file(&name) {
                Ok(()) => {
                    debug!("deleted {name}");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!("failed to delete {name}, will retry on a later pass: {e}");
                    report.failed.push(name);
                }
            }
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            debug!(
                "deleter pass at generation {}: {} deleted, {} failed, {} retained",
                committed.generation,
                report.deleted.len(),
                report.failed.len(),
                report.retained
            );
        }
        Ok(report)
    }
}

/// Remove a generation file left behind by an earlier failed attempt.
///
/// Only valid under the write lock and for a generation above the latest
/// committed one: such a name is referenced by no commit and no session.
pub(crate) fn clear_leftover(storage: &dyn Storage, name: &str) -> Result<()> {
    if storage.file_exists(name) {
        debug!("removing leftover {name}");
        storage.delete_file(name)?;
    }
    Ok(())
}

/// Best-effort removal of files written by a failed or abandoned change.
pub(crate) fn discard_files<'n, I>(storage: &dyn Storage, names: I)
where
    I: IntoIterator<Item = &'n String>,
{
    for name in names {
        if let Err(e) = storage.delete_file(name) {
            warn!("failed to remove uncommitted {name}: {e}");
        }
    }
}
