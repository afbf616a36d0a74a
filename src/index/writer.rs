//! Writer sessions.
//!
//! An [`IndexWriter`] holds the directory write lock for its whole lifetime.
//! It keeps two descriptors: `committed`, the generation last published, and
//! `working`, which accumulates flushed segments, new deletion generations
//! and merges. Nothing in `working` is visible to readers until
//! [`IndexWriter::commit`] publishes it as the next generation.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};

use crate::config::{IndexConfig, OpenMode};
use crate::document::{Document, Term};
use crate::error::{Result, TesseraError};
use crate::index::commit::CommitDescriptor;
use crate::index::deleter::{self, FileDeleter, FileRefs};
use crate::index::deletes::DeletionBitmap;
use crate::index::file_names::{self, IndexFileKind};
use crate::index::norms::NormsBlob;
use crate::index::segment::{MergeSource, SegmentData, SegmentDescriptor};
use crate::storage::lock::WRITE_LOCK_NAME;
use crate::storage::{IndexLock, Storage};

/// A buffered delete-by-term. Buffered documents at positions below
/// `doc_upto` were added before the delete and are affected by it.
#[derive(Debug, Clone)]
struct BufferedDelete {
    term: Term,
    doc_upto: usize,
}

/// The single writer of an index.
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    refs: FileRefs,
    config: IndexConfig,
    lock: Box<dyn IndexLock>,

    /// Last generation this writer published or opened on.
    committed: CommitDescriptor,

    /// Committed state plus flushed, not yet committed changes.
    working: CommitDescriptor,

    buffered_docs: Vec<Document>,
    buffered_deletes: Vec<BufferedDelete>,

    /// Files written since the last commit.
    new_files: BTreeSet<String>,

    /// Loaded segment payloads by segment name.
    segment_cache: AHashMap<String, Arc<SegmentData>>,

    closed: bool,
}

impl IndexWriter {
    /// Obtain the write lock and open the index according to
    /// `config.open_mode`.
    ///
    /// A new index, or one opened with [`OpenMode::Create`], is committed
    /// immediately so the directory always holds a readable commit.
    pub fn open(storage: Arc<dyn Storage>, refs: FileRefs, config: IndexConfig) -> Result<Self> {
        config.validate()?;

        let mut lock = storage.make_lock(WRITE_LOCK_NAME);
        lock.obtain(&config.lock.retry_policy())?;

        let existing = match CommitDescriptor::read(storage.as_ref()) {
            Ok(commit) => Some(commit),
            Err(TesseraError::IndexNotFound(_)) => None,
            Err(e @ TesseraError::CorruptIndex(_)) if config.open_mode == OpenMode::Create => {
                warn!("overwriting unreadable index in {}: {e}", storage.location());
                None
            }
            Err(e) => return Err(e),
        };

        let (committed, working, initial_commit) = match (config.open_mode, existing) {
            (OpenMode::Append, None) => {
                return Err(TesseraError::index_not_found(format!(
                    "no index to append to in {}",
                    storage.location()
                )));
            }
            (OpenMode::Create, Some(previous)) => {
                let fresh = CommitDescriptor {
                    generation: previous.generation,
                    version: previous.version,
                    counter: previous.counter,
                    ..CommitDescriptor::new()
                };
                (previous, fresh, true)
            }
            (_, Some(previous)) => (previous.clone(), previous, false),
            (_, None) => {
                // Keep generations above any unreadable commit still on disk.
                let generation = CommitDescriptor::latest_generation(storage.as_ref())?.unwrap_or(0);
                let fresh = CommitDescriptor {
                    generation,
                    ..CommitDescriptor::new()
                };
                (fresh.clone(), fresh, true)
            }
        };

        let mut writer = IndexWriter {
            storage,
            refs,
            config,
            lock,
            committed,
            working,
            buffered_docs: Vec::new(),
            buffered_deletes: Vec::new(),
            new_files: BTreeSet::new(),
            segment_cache: AHashMap::new(),
            closed: false,
        };

        writer.collect_garbage();
        writer.skip_leftover_segment_names()?;

        if initial_commit {
            writer.publish()?;
        }
        info!(
            "opened writer on {} at generation {}",
            writer.storage.location(),
            writer.committed.generation
        );
        Ok(writer)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(TesseraError::already_closed("index writer is closed"))
        } else {
            Ok(())
        }
    }

    /// Move the segment counter past segment files a crashed session left
    /// behind, so new segments never reuse their names.
    fn skip_leftover_segment_names(&mut self) -> Result<()> {
        let highest = self
            .storage
            .list_files()?
            .iter()
            .filter_map(|name| IndexFileKind::parse(name))
            .filter_map(|kind| kind.segment().and_then(file_names::segment_counter))
            .max();
        if let Some(highest) = highest.filter(|&highest| highest >= self.working.counter) {
            debug!("advancing segment counter past leftover segment {highest}");
            self.working.counter = highest + 1;
        }
        Ok(())
    }

    /// Buffer a document. Flushes once `max_buffered_docs` are buffered.
    pub fn add_document(&mut self, doc: Document) -> Result<()> {
        self.check_closed()?;
        self.buffered_docs.push(doc);
        if self.should_flush() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn add_documents<I: IntoIterator<Item = Document>>(&mut self, docs: I) -> Result<()> {
        for doc in docs {
            self.add_document(doc)?;
        }
        Ok(())
    }

    fn should_flush(&self) -> bool {
        self.buffered_docs.len() >= self.config.max_buffered_docs
    }

    /// Delete every document containing `term`, including buffered documents
    /// added before this call. Applied at the next flush.
    pub fn delete_documents(&mut self, term: Term) -> Result<()> {
        self.check_closed()?;
        self.buffered_deletes.push(BufferedDelete {
            term,
            doc_upto: self.buffered_docs.len(),
        });
        Ok(())
    }

    /// Delete documents containing `term`, then add `doc`.
    pub fn update_document(&mut self, term: Term, doc: Document) -> Result<()> {
        self.delete_documents(term)?;
        self.add_document(doc)
    }

    /// Write buffered documents as a new segment and apply buffered deletes.
    ///
    /// All or nothing: on failure the files written by this call are removed
    /// and the buffers and working descriptor are left as they were.
    pub fn flush(&mut self) -> Result<()> {
        self.check_closed()?;
        if self.buffered_docs.is_empty() && self.buffered_deletes.is_empty() {
            return Ok(());
        }

        let mut next = self.working.clone();
        let mut written = Vec::new();
        let flushed = match self.flush_into(&mut next, &mut written) {
            Ok(flushed) => flushed,
            Err(e) => {
                deleter::discard_files(self.storage.as_ref(), &written);
                return Err(e);
            }
        };

        debug!(
            "flushed {} documents and {} deletes ({} files)",
            self.buffered_docs.len(),
            self.buffered_deletes.len(),
            written.len()
        );
        if let Some((name, data)) = flushed {
            self.segment_cache.insert(name, data);
        }
        self.working = next;
        self.new_files.extend(written);
        self.buffered_docs.clear();
        self.buffered_deletes.clear();

        self.maybe_merge()
    }

    /// Returns the new segment, if documents were buffered.
    fn flush_into(
        &mut self,
        next: &mut CommitDescriptor,
        written: &mut Vec<String>,
    ) -> Result<Option<(String, Arc<SegmentData>)>> {
        let mut new_segment = None;
        if !self.buffered_docs.is_empty() {
            let name = next.new_segment_name();
            let data = SegmentData::from_documents(&self.buffered_docs);
            let descriptor =
                SegmentDescriptor::new(&name, data.doc_count(), self.config.use_compound_file);
            written.extend(data.write(self.storage.as_ref(), &descriptor)?);
            next.segments.push(descriptor);
            new_segment = Some((name, Arc::new(data)));
        }

        if self.buffered_deletes.is_empty() {
            return Ok(new_segment);
        }
        for index in 0..next.segments.len() {
            let fresh = new_segment
                .as_ref()
                .filter(|(name, _)| *name == next.segments[index].name)
                .map(|(_, data)| Arc::clone(data));
            let is_new = fresh.is_some();
            let data = match fresh {
                Some(data) => data,
                None => self.load_segment(&next.segments[index])?,
            };
            let descriptor = &mut next.segments[index];

            let mut deletions: Option<DeletionBitmap> = None;
            for delete in &self.buffered_deletes {
                let Some(field_number) = data.field_number(&delete.term.field) else {
                    continue;
                };
                for &doc in data.postings(field_number, &delete.term.text) {
                    if is_new && doc as usize >= delete.doc_upto {
                        continue;
                    }
                    if deletions.is_none() {
                        deletions = Some(DeletionBitmap::for_segment(
                            self.storage.as_ref(),
                            descriptor,
                        )?);
                    }
                    if let Some(bitmap) = deletions.as_mut() {
                        bitmap.delete(doc)?;
                    }
                }
            }

            let Some(mut bitmap) = deletions else {
                continue;
            };
            if bitmap.count() != descriptor.del_count {
                bitmap.generation = descriptor.next_del_generation();
                let name = bitmap.file_name();
                deleter::clear_leftover(self.storage.as_ref(), &name)?;
                written.push(bitmap.write(self.storage.as_ref())?);
                descriptor.del_generation = Some(bitmap.generation);
                descriptor.del_count = bitmap.count();
            }
        }
        Ok(new_segment)
    }

    fn load_segment(&mut self, descriptor: &SegmentDescriptor) -> Result<Arc<SegmentData>> {
        if let Some(data) = self.segment_cache.get(&descriptor.name) {
            return Ok(Arc::clone(data));
        }
        let data = Arc::new(SegmentData::read(self.storage.as_ref(), descriptor)?);
        self.segment_cache.insert(descriptor.name.clone(), Arc::clone(&data));
        Ok(data)
    }

    /// Merge while there are more than `merge_factor` segments.
    fn maybe_merge(&mut self) -> Result<()> {
        while self.working.segments.len() > self.config.merge_factor {
            let start = self.working.segments.len() - self.config.merge_factor;
            let names: Vec<String> = self.working.segments[start..]
                .iter()
                .map(|segment| segment.name.clone())
                .collect();
            self.merge_internal(&names)?;
        }
        Ok(())
    }

    /// Merge the named segments into one new segment placed where the first
    /// of them was. Deleted documents are dropped. Returns the new segment's
    /// name, or `None` if no live documents remained.
    pub fn merge_segments(&mut self, names: &[String]) -> Result<Option<String>> {
        self.check_closed()?;
        self.flush()?;
        self.merge_internal(names)
    }

    /// Merge every segment into one.
    pub fn optimize(&mut self) -> Result<()> {
        self.check_closed()?;
        self.flush()?;
        let single_clean = self.working.segments.len() == 1
            && !self.working.segments[0].has_deletions()
            && self.working.segments[0].norm_generations.is_empty();
        if self.working.segments.is_empty() || single_clean {
            return Ok(());
        }
        let names: Vec<String> = self.working.segments.iter().map(|s| s.name.clone()).collect();
        self.merge_internal(&names)?;
        Ok(())
    }

    fn merge_internal(&mut self, names: &[String]) -> Result<Option<String>> {
        if names.is_empty() {
            return Ok(None);
        }
        let mut next = self.working.clone();

        let mut inputs = Vec::with_capacity(names.len());
        for name in names {
            let descriptor = next.segment(name).cloned().ok_or_else(|| {
                TesseraError::invalid_argument(format!("unknown segment {name}"))
            })?;
            let data = self.load_segment(&descriptor)?;
            let deletions = match descriptor.del_generation {
                Some(_) => Some(DeletionBitmap::for_segment(self.storage.as_ref(), &descriptor)?),
                None => None,
            };
            let overrides = NormsBlob::read_overrides(self.storage.as_ref(), &descriptor)?;
            inputs.push((data, deletions, overrides));
        }
        let sources: Vec<MergeSource<'_>> = inputs
            .iter()
            .map(|(data, deletions, overrides)| MergeSource {
                data: data.as_ref(),
                deletions: deletions.as_ref(),
                norm_overrides: overrides.clone(),
            })
            .collect();
        let merged = SegmentData::merge(&sources);

        let position = next
            .segments
            .iter()
            .position(|segment| names.contains(&segment.name))
            .unwrap_or(next.segments.len());
        next.segments.retain(|segment| !names.contains(&segment.name));

        let mut written = Vec::new();
        let merged_name = if merged.doc_count() == 0 {
            None
        } else {
            let name = next.new_segment_name();
            let descriptor =
                SegmentDescriptor::new(&name, merged.doc_count(), self.config.use_compound_file);
            written = merged.write(self.storage.as_ref(), &descriptor)?;
            next.segments.insert(position, descriptor);
            Some(name)
        };

        debug!(
            "merged {} segments into {}",
            names.len(),
            merged_name.as_deref().unwrap_or("nothing")
        );
        for name in names {
            self.segment_cache.remove(name);
        }
        if let Some(name) = &merged_name {
            self.segment_cache.insert(name.clone(), Arc::new(merged));
        }
        self.working = next;
        self.new_files.extend(written);
        Ok(merged_name)
    }

    /// Drop a segment from the working descriptor.
    pub fn remove_segment(&mut self, name: &str) -> Result<()> {
        self.check_closed()?;
        let before = self.working.segments.len();
        self.working.segments.retain(|segment| segment.name != name);
        if self.working.segments.len() == before {
            return Err(TesseraError::invalid_argument(format!("unknown segment {name}")));
        }
        self.segment_cache.remove(name);
        Ok(())
    }

    /// Drop every segment and everything buffered.
    pub fn delete_all(&mut self) -> Result<()> {
        self.check_closed()?;
        self.buffered_docs.clear();
        self.buffered_deletes.clear();
        self.working.segments.clear();
        self.segment_cache.clear();
        Ok(())
    }

    /// Attach caller metadata to the next commit.
    pub fn set_commit_data<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> Result<()> {
        self.check_closed()?;
        self.working.user_data.insert(key.into(), value.into());
        Ok(())
    }

    /// Flush and publish the working descriptor as a new generation, then
    /// reclaim files no longer referenced.
    ///
    /// On failure the previous commit stays the latest; flushed changes are
    /// kept so the commit can be retried, or discarded with [`rollback`].
    ///
    /// [`rollback`]: IndexWriter::rollback
    pub fn commit(&mut self) -> Result<()> {
        self.check_closed()?;
        self.flush()?;
        if self.working == self.committed {
            return Ok(());
        }
        self.publish()
    }

    fn publish(&mut self) -> Result<()> {
        let mut next = self.working.clone();
        next.write(self.storage.as_ref())?;

        info!(
            "committed generation {} ({} segments, {} docs)",
            next.generation,
            next.segments.len(),
            next.num_docs()
        );
        self.committed = next.clone();
        self.working = next;
        self.new_files.clear();
        self.collect_garbage();
        Ok(())
    }

    fn collect_garbage(&self) {
        let deleter = FileDeleter::new(self.storage.as_ref(), &self.refs);
        if let Err(e) = deleter.run(&self.committed) {
            warn!("file deleter pass failed: {e}");
        }
    }

    /// Discard uncommitted changes and close without committing.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_closed()?;
        self.discard_pending();
        self.collect_garbage();
        self.closed = true;
        self.release_lock()
    }

    fn discard_pending(&mut self) {
        self.buffered_docs.clear();
        self.buffered_deletes.clear();
        deleter::discard_files(self.storage.as_ref(), &self.new_files);
        self.new_files.clear();
        self.working = self.committed.clone();
        self.segment_cache.clear();
    }

    fn release_lock(&mut self) -> Result<()> {
        self.lock.release()
    }

    /// Commit and release the write lock.
    ///
    /// If the commit fails the pending changes are discarded, the lock is
    /// still released and the commit error is returned.
    pub fn close(&mut self) -> Result<()> {
        self.check_closed()?;
        let committed = self.commit();
        if committed.is_err() {
            self.discard_pending();
            self.collect_garbage();
        }
        self.closed = true;
        let released = self.release_lock();
        committed.and(released)
    }

    /// Number of buffered, not yet flushed documents.
    pub fn pending_docs(&self) -> usize {
        self.buffered_docs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flushed and buffered documents, including flushed deletions.
    pub fn max_doc(&self) -> u64 {
        self.working.max_doc() + self.buffered_docs.len() as u64
    }

    /// Live documents, not counting buffered deletes.
    pub fn num_docs(&self) -> u64 {
        self.working.num_docs() + self.buffered_docs.len() as u64
    }

    /// Segments of the working descriptor.
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.working.segments
    }

    /// The last published commit.
    pub fn committed(&self) -> &CommitDescriptor {
        &self.committed
    }

    pub fn generation(&self) -> u64 {
        self.committed.generation
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Whether anyone holds the write lock of `storage`.
    pub fn is_locked(storage: &dyn Storage) -> Result<bool> {
        storage.make_lock(WRITE_LOCK_NAME).is_locked()
    }

    /// Forcibly remove the write lock of `storage`.
    ///
    /// Only safe when no writer or committing reader is alive; otherwise two
    /// sessions may write the same generation.
    pub fn unlock(storage: &dyn Storage) -> Result<()> {
        warn!("forcibly releasing {WRITE_LOCK_NAME} in {}", storage.location());
        storage.clear_lock(WRITE_LOCK_NAME)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.new_files.is_empty() {
            debug!("writer dropped with {} uncommitted files", self.new_files.len());
            deleter::discard_files(self.storage.as_ref(), &self.new_files);
        }
        if let Err(e) = self.lock.release() {
            warn!("failed to release {WRITE_LOCK_NAME} on drop: {e}");
        }
    }
}
