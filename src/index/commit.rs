//! Commit descriptors and the generation protocol.
//!
//! A commit is a file `segments_<gen>` listing the segments of the index and,
//! for each, its current deletion and norms generations. Commits are never
//! modified: every commit writes the next generation under a pending name,
//! syncs it, renames it into place, and finally updates the `segments.gen`
//! pointer. The rename is the commit point. The latest commit is the highest
//! generation with a valid checksum; file times are never consulted.
//!
//! # Examples
//!
//! ```
//! use tessera::index::commit::CommitDescriptor;
//! use tessera::storage::memory::MemoryStorage;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = MemoryStorage::new_default();
//! assert!(CommitDescriptor::read(&storage).is_err());
//!
//! let mut commit = CommitDescriptor::new();
//! commit.write(&storage)?;
//! assert_eq!(commit.generation, 1);
//! assert_eq!(CommitDescriptor::latest_generation(&storage)?, Some(1));
//! assert_eq!(CommitDescriptor::read(&storage)?, commit);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};

use crate::error::{Result, TesseraError};
use crate::index::file_names::{self, COMMIT_POINTER, COMMIT_POINTER_TMP};
use crate::index::segment::SegmentDescriptor;
use crate::storage::structured::{open_file, write_file};
use crate::storage::{Storage, is_not_found};

const COMMIT_MAGIC: u32 = 0x5453434D; // "TSCM"
const COMMIT_FORMAT: u32 = 1;
const POINTER_FORMAT: u32 = 2;
const MAX_READ_ATTEMPTS: usize = 5;

/// User-data key holding the commit time in milliseconds since the epoch.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// A versioned, ordered set of segment descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitDescriptor {
    /// Generation of the `segments_<gen>` file; 0 if never written.
    pub generation: u64,
    /// Incremented by every commit.
    pub version: u64,
    /// Counter naming the next new segment.
    pub counter: u64,
    pub segments: Vec<SegmentDescriptor>,
    /// Commit time plus caller metadata.
    pub user_data: BTreeMap<String, String>,
}

impl CommitDescriptor {
    /// An empty, never written descriptor.
    pub fn new() -> Self {
        CommitDescriptor::default()
    }

    /// Name of this descriptor's commit file, if it was written.
    pub fn file_name(&self) -> Option<String> {
        (self.generation > 0).then(|| file_names::commit_file_name(self.generation))
    }

    /// Every file this descriptor references, sorted and without duplicates.
    pub fn files(&self, include_commit_file: bool) -> Vec<String> {
        let mut files = BTreeSet::new();
        if include_commit_file {
            files.extend(self.file_name());
        }
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files.into_iter().collect()
    }

    /// Documents including deleted ones.
    pub fn max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count as u64).sum()
    }

    /// Live documents.
    pub fn num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentDescriptor> {
        self.segments.iter().find(|segment| segment.name == name)
    }

    pub fn segment_mut(&mut self, name: &str) -> Option<&mut SegmentDescriptor> {
        self.segments.iter_mut().find(|segment| segment.name == name)
    }

    /// Allocate the name of a new segment.
    pub fn new_segment_name(&mut self) -> String {
        let name = file_names::segment_name(self.counter);
        self.counter += 1;
        name
    }

    /// Time of the commit, if recorded.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let millis = self.user_data.get(TIMESTAMP_KEY)?.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Highest commit generation present, from the listing and the pointer
    /// file. Parses no descriptor and takes no lock.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        let listed = storage
            .list_files()?
            .iter()
            .filter_map(|name| file_names::commit_generation(name))
            .max();
        Ok(listed.max(read_pointer(storage)))
    }

    /// Whether `generation` is the latest valid commit.
    ///
    /// Decided from the listing alone while no newer generation is present.
    /// Newer candidates are parsed, and those that are missing or fail
    /// validation are skipped, the same way [`read`](CommitDescriptor::read)
    /// skips them.
    pub fn is_latest(storage: &dyn Storage, generation: u64) -> Result<bool> {
        let mut newer: BTreeSet<u64> = storage
            .list_files()?
            .iter()
            .filter_map(|name| file_names::commit_generation(name))
            .filter(|&candidate| candidate > generation)
            .collect();
        newer.extend(read_pointer(storage).filter(|&candidate| candidate > generation));

        for &candidate in newer.iter().rev() {
            match CommitDescriptor::read_generation(storage, candidate) {
                Ok(_) => return Ok(false),
                Err(TesseraError::CorruptIndex(_)) => {
                    debug!("ignoring unreadable commit generation {candidate}");
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(storage.file_exists(&file_names::commit_file_name(generation)))
    }

    /// Read the latest valid commit.
    ///
    /// Candidates are tried from the highest generation down; a candidate that
    /// is missing or fails validation is skipped. Other I/O errors propagate
    /// so a transient fault never silently selects an older commit.
    pub fn read(storage: &dyn Storage) -> Result<CommitDescriptor> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut candidates: BTreeSet<u64> = storage
                .list_files()?
                .iter()
                .filter_map(|name| file_names::commit_generation(name))
                .collect();
            candidates.extend(read_pointer(storage));

            if candidates.is_empty() {
                return Err(TesseraError::index_not_found(format!(
                    "no segments_N file in {}",
                    storage.location()
                )));
            }

            let latest = candidates.last().copied().unwrap_or(0);
            let mut corrupt = None;
            for &generation in candidates.iter().rev() {
                match CommitDescriptor::read_generation(storage, generation) {
                    Ok(descriptor) => {
                        if generation != latest {
                            info!(
                                "fell back to commit generation {generation} (latest is {latest})"
                            );
                        }
                        return Ok(descriptor);
                    }
                    Err(e @ TesseraError::CorruptIndex(_)) => {
                        warn!("skipping commit generation {generation}: {e}");
                        corrupt = Some(e);
                    }
                    Err(e) if is_not_found(&e) => {
                        debug!("commit generation {generation} vanished: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(e) = corrupt {
                return Err(e);
            }
            // Every listed commit was superseded and reclaimed meanwhile.
            if attempt >= MAX_READ_ATTEMPTS {
                return Err(TesseraError::index_not_found(format!(
                    "no readable segments_N file in {}",
                    storage.location()
                )));
            }
        }
    }

    /// Read and validate commit generation `generation`.
    pub fn read_generation(storage: &dyn Storage, generation: u64) -> Result<CommitDescriptor> {
        let name = file_names::commit_file_name(generation);
        let mut reader = open_file(storage, &name)?;

        if reader.read_u32()? != COMMIT_MAGIC {
            return Err(reader.invalid("bad commit magic"));
        }
        let format = reader.read_u32()?;
        if format != COMMIT_FORMAT {
            return Err(reader.invalid(format!("unsupported commit format {format}")));
        }
        let stored_generation = reader.read_u64()?;
        if stored_generation != generation {
            return Err(reader.invalid(format!("records generation {stored_generation}")));
        }
        let version = reader.read_u64()?;
        let counter = reader.read_u64()?;

        let segment_count = reader.read_varint()?;
        let mut segments: Vec<SegmentDescriptor> = Vec::new();
        for _ in 0..segment_count {
            let segment = SegmentDescriptor::read_from(&mut reader)?;
            if segments.iter().any(|s| s.name == segment.name) {
                return Err(reader.invalid(format!("duplicate segment {}", segment.name)));
            }
            if file_names::segment_counter(&segment.name).is_some_and(|c| c >= counter) {
                return Err(reader.invalid(format!(
                    "segment {} not below counter {counter}",
                    segment.name
                )));
            }
            segments.push(segment);
        }
        let user_data = reader.read_string_map()?;
        reader.finish()?;

        Ok(CommitDescriptor {
            generation,
            version,
            counter,
            segments,
            user_data,
        })
    }

    /// Every valid commit present, oldest first.
    pub fn list_commits(storage: &dyn Storage) -> Result<Vec<CommitDescriptor>> {
        let mut generations: Vec<u64> = storage
            .list_files()?
            .iter()
            .filter_map(|name| file_names::commit_generation(name))
            .collect();
        generations.sort_unstable();

        let mut commits = Vec::new();
        for generation in generations {
            match CommitDescriptor::read_generation(storage, generation) {
                Ok(commit) => commits.push(commit),
                Err(e) => debug!("not listing commit generation {generation}: {e}"),
            }
        }
        Ok(commits)
    }

    /// Publish this descriptor as the next commit generation.
    ///
    /// The new generation is one above both this descriptor's and the highest
    /// present in storage. On success `self` carries the new generation,
    /// version and timestamp. On failure `self` is unchanged, no new
    /// `segments_N` is visible and the pending file has been removed.
    pub fn write(&mut self, storage: &dyn Storage) -> Result<()> {
        let on_disk = CommitDescriptor::latest_generation(storage)?.unwrap_or(0);
        let mut next = self.clone();
        next.generation = self.generation.max(on_disk) + 1;
        next.version = self.version + 1;
        next.user_data.insert(
            TIMESTAMP_KEY.to_string(),
            Utc::now().timestamp_millis().to_string(),
        );

        let pending = file_names::pending_commit_file_name(next.generation);
        let target = file_names::commit_file_name(next.generation);

        write_file(storage, &pending, |writer| {
            writer.write_u32(COMMIT_MAGIC)?;
            writer.write_u32(COMMIT_FORMAT)?;
            writer.write_u64(next.generation)?;
            writer.write_u64(next.version)?;
            writer.write_u64(next.counter)?;
            writer.write_varint(next.segments.len() as u64)?;
            for segment in &next.segments {
                segment.write_to(writer)?;
            }
            writer.write_string_map(&next.user_data)
        })?;

        // Segment and generation files must be durable before the commit
        // that references them becomes visible.
        if let Err(e) = storage.sync().and_then(|_| storage.rename_file(&pending, &target)) {
            if let Err(cleanup) = storage.delete_file(&pending) {
                warn!("failed to remove {pending}: {cleanup}");
            }
            return Err(e);
        }

        // Committed. Nothing below may fail the commit.
        if let Err(e) = storage.sync() {
            warn!("sync after publishing {target} failed: {e}");
        }
        if let Err(e) = write_pointer(storage, next.generation) {
            warn!("failed to update {COMMIT_POINTER}: {e}");
        }

        debug!(
            "committed {target} (version {}, {} segments)",
            next.version,
            next.segments.len()
        );
        *self = next;
        Ok(())
    }
}

/// Generation recorded in the pointer file, if it is present and intact.
fn read_pointer(storage: &dyn Storage) -> Option<u64> {
    if !storage.file_exists(COMMIT_POINTER) {
        return None;
    }
    let read = || -> Result<u64> {
        let mut reader = open_file(storage, COMMIT_POINTER)?;
        if reader.read_u32()? != POINTER_FORMAT {
            return Err(reader.invalid("unknown pointer format"));
        }
        let first = reader.read_u64()?;
        let second = reader.read_u64()?;
        if first != second {
            return Err(reader.invalid(format!("generations disagree: {first} != {second}")));
        }
        reader.finish()?;
        Ok(first)
    };
    match read() {
        Ok(generation) => Some(generation),
        Err(e) => {
            debug!("ignoring {COMMIT_POINTER}: {e}");
            None
        }
    }
}

fn write_pointer(storage: &dyn Storage, generation: u64) -> Result<()> {
    write_file(storage, COMMIT_POINTER_TMP, |writer| {
        writer.write_u32(POINTER_FORMAT)?;
        writer.write_u64(generation)?;
        writer.write_u64(generation)
    })?;
    storage.rename_file(COMMIT_POINTER_TMP, COMMIT_POINTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn commit_with_segment(storage: &MemoryStorage) -> CommitDescriptor {
        let mut commit = CommitDescriptor::new();
        let name = commit.new_segment_name();
        let mut segment = SegmentDescriptor::new(&name, 5, false);
        segment.del_generation = Some(1);
        segment.del_count = 2;
        segment.norm_generations.insert(0, 3);
        commit.segments.push(segment);
        commit.user_data.insert("source".to_string(), "test".to_string());
        commit.write(storage).unwrap();
        commit
    }

    #[test]
    fn test_empty_storage_is_index_not_found() {
        let storage = MemoryStorage::new_default();
        assert!(matches!(
            CommitDescriptor::read(&storage),
            Err(TesseraError::IndexNotFound(_))
        ));
        assert_eq!(CommitDescriptor::latest_generation(&storage).unwrap(), None);
    }

    #[test]
    fn test_write_read() {
        let storage = MemoryStorage::new_default();
        let commit = commit_with_segment(&storage);

        assert_eq!(commit.generation, 1);
        assert_eq!(commit.version, 1);
        assert!(commit.timestamp().is_some());
        assert!(storage.file_exists("segments_1"));
        assert!(storage.file_exists(COMMIT_POINTER));
        assert!(!storage.file_exists("pending_segments_1"));

        let read = CommitDescriptor::read(&storage).unwrap();
        assert_eq!(read, commit);
        assert_eq!(read.max_doc(), 5);
        assert_eq!(read.num_docs(), 3);
        assert_eq!(
            read.files(true),
            vec!["_0.nrm", "_0.seg", "_0_1.del", "_0_3.s0", "segments_1"]
        );
        assert!(!read.files(false).contains(&"segments_1".to_string()));
    }

    #[test]
    fn test_generations_increase() {
        let storage = MemoryStorage::new_default();
        let mut commit = CommitDescriptor::new();
        commit.write(&storage).unwrap();
        commit.write(&storage).unwrap();
        assert_eq!(commit.generation, 2);
        assert_eq!(commit.version, 2);

        // A stale copy still moves past what is on disk.
        let mut stale = CommitDescriptor::new();
        stale.write(&storage).unwrap();
        assert_eq!(stale.generation, 3);
        assert_eq!(CommitDescriptor::read(&storage).unwrap().generation, 3);
        assert_eq!(CommitDescriptor::list_commits(&storage).unwrap().len(), 3);
    }

    #[test]
    fn test_corrupt_latest_falls_back() {
        let storage = MemoryStorage::new_default();
        let first = commit_with_segment(&storage);
        let mut second = first.clone();
        second.write(&storage).unwrap();

        storage.corrupt_file("segments_2", 10).unwrap();
        let read = CommitDescriptor::read(&storage).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read, first);

        // Generation 1 is still the latest commit worth reading.
        assert_eq!(CommitDescriptor::latest_generation(&storage).unwrap(), Some(2));
        assert!(CommitDescriptor::is_latest(&storage, 1).unwrap());

        storage.corrupt_file("segments_1", 10).unwrap();
        assert!(matches!(
            CommitDescriptor::read(&storage),
            Err(TesseraError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_pointer_is_advisory() {
        let storage = MemoryStorage::new_default();
        let mut commit = CommitDescriptor::new();
        commit.write(&storage).unwrap();
        commit.write(&storage).unwrap();

        // A pointer lagging behind the listing does not hide the newer commit.
        write_pointer(&storage, 1).unwrap();
        assert_eq!(CommitDescriptor::latest_generation(&storage).unwrap(), Some(2));
        assert_eq!(CommitDescriptor::read(&storage).unwrap().generation, 2);
        assert!(CommitDescriptor::is_latest(&storage, 2).unwrap());
        assert!(!CommitDescriptor::is_latest(&storage, 1).unwrap());

        // A pointer to a commit that no longer exists finds nothing.
        let empty = MemoryStorage::new_default();
        write_pointer(&empty, 7).unwrap();
        assert_eq!(CommitDescriptor::latest_generation(&empty).unwrap(), Some(7));
        assert!(matches!(
            CommitDescriptor::read(&empty),
            Err(TesseraError::IndexNotFound(_))
        ));
        assert!(!CommitDescriptor::is_latest(&empty, 3).unwrap());

        // A garbage pointer is ignored.
        storage.corrupt_file(COMMIT_POINTER, 0).unwrap();
        assert_eq!(CommitDescriptor::latest_generation(&storage).unwrap(), Some(2));
    }

    #[test]
    fn test_failed_write_leaves_previous_commit() {
        use crate::storage::fault::FaultInjectingStorage;
        use std::sync::Arc;

        let inner = Arc::new(MemoryStorage::new_default());
        let storage = FaultInjectingStorage::new(inner.clone(), 1);
        let mut commit = CommitDescriptor::new();
        commit.write(&storage).unwrap();
        let before = commit.clone();

        storage.set_max_size(Some(inner.size_in_bytes().unwrap()));
        commit.user_data.insert("big".to_string(), "x".repeat(64));
        assert!(commit.write(&storage).is_err());

        let mut expected = before.clone();
        expected.user_data.insert("big".to_string(), "x".repeat(64));
        assert_eq!(commit, expected);
        assert!(!inner.file_exists("pending_segments_2"));
        assert!(!inner.file_exists("segments_2"));
        assert_eq!(CommitDescriptor::read(&storage).unwrap(), before);
    }
}
