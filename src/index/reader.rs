//! Reader sessions.
//!
//! An [`IndexReader`] binds to one commit generation when it opens and keeps
//! serving that generation until it is reopened. A reader may also stage
//! deletions and norm changes: the first such change acquires the directory
//! write lock and checks that no newer commit exists, so changes are never
//! made against a stale view. [`IndexReader::commit`] writes the touched
//! generation files, publishes a new commit and re-binds the reader to it.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use tessera::config::IndexConfig;
//! use tessera::document::{Document, Term};
//! use tessera::index::deleter::FileRefs;
//! use tessera::index::reader::IndexReader;
//! use tessera::index::writer::IndexWriter;
//! use tessera::storage::Storage;
//! use tessera::storage::memory::MemoryStorage;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let refs = FileRefs::new();
//!
//! let mut writer = IndexWriter::open(storage.clone(), refs.clone(), IndexConfig::default())?;
//! writer.add_document(Document::builder().add_text("body", "hello world").build())?;
//! writer.close()?;
//!
//! let mut reader = IndexReader::open(storage, refs, IndexConfig::default())?;
//! assert_eq!(reader.delete_documents(&Term::new("body", "hello"))?, 1);
//! reader.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::IndexConfig;
use crate::document::Term;
use crate::error::{Result, TesseraError};
use crate::index::commit::CommitDescriptor;
use crate::index::deleter::{self, FileDeleter, FileRefs};
use crate::index::deletes::DeletionBitmap;
use crate::index::norms::{NormsBlob, encode_norm};
use crate::index::segment::{SegmentData, SegmentDescriptor};
use crate::storage::lock::{LockRetryPolicy, WRITE_LOCK_NAME};
use crate::storage::{IndexLock, Storage, is_not_found};

/// Times `open` re-reads the latest commit when files of the one it picked
/// vanish underneath it.
const MAX_OPEN_ATTEMPTS: usize = 5;

/// Lifecycle of a reader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    /// Bound to a commit, nothing staged.
    Opened,
    /// Changes staged; the write lock is (or was) held.
    PendingChanges,
    /// Staged changes were published; bound to the new commit.
    Committed,
    Closed,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::Opened => "opened",
            ReaderState::PendingChanges => "pending_changes",
            ReaderState::Committed => "committed",
            ReaderState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-segment view: the shared payload plus this session's deletions and
/// norms overrides.
#[derive(Debug, Clone)]
struct SegmentReader {
    descriptor: SegmentDescriptor,
    data: Arc<SegmentData>,
    deletions: DeletionBitmap,
    deletions_dirty: bool,
    /// Effective norms of fields with an override, by field number.
    norms: AHashMap<u32, Vec<u8>>,
    dirty_norms: BTreeSet<u32>,
}

impl SegmentReader {
    fn open(
        storage: &dyn Storage,
        descriptor: &SegmentDescriptor,
        data: Option<Arc<SegmentData>>,
    ) -> Result<Self> {
        let data = match data {
            Some(data) => data,
            None => Arc::new(SegmentData::read(storage, descriptor)?),
        };
        let deletions = DeletionBitmap::for_segment(storage, descriptor)?;
        if deletions.count() != descriptor.del_count {
            return Err(TesseraError::corrupt(format!(
                "segment {}: {} deletions on disk, commit says {}",
                descriptor.name,
                deletions.count(),
                descriptor.del_count
            )));
        }
        let norms = NormsBlob::read_overrides(storage, descriptor)?
            .into_iter()
            .collect();

        Ok(SegmentReader {
            descriptor: descriptor.clone(),
            data,
            deletions,
            deletions_dirty: false,
            norms,
            dirty_norms: BTreeSet::new(),
        })
    }

    fn max_doc(&self) -> u32 {
        self.descriptor.doc_count
    }

    fn num_docs(&self) -> u32 {
        self.max_doc() - self.deletions.count()
    }

    fn effective_norms(&self, field_number: u32) -> Option<&[u8]> {
        match self.norms.get(&field_number) {
            Some(norms) => Some(norms.as_slice()),
            None => self.data.base_norms(field_number),
        }
    }

    fn is_dirty(&self) -> bool {
        self.deletions_dirty || !self.dirty_norms.is_empty()
    }
}

/// A session bound to one commit generation.
#[derive(Debug)]
pub struct IndexReader {
    storage: Arc<dyn Storage>,
    refs: FileRefs,
    config: IndexConfig,
    bound: CommitDescriptor,
    /// Files of `bound` this session holds references on.
    referenced: Vec<String>,
    segments: Vec<SegmentReader>,
    /// First global doc id of each segment.
    starts: Vec<u32>,
    lock: Option<Box<dyn IndexLock>>,
    state: ReaderState,
}

impl IndexReader {
    /// Open on the latest commit.
    ///
    /// If files of that commit disappear while loading because a newer
    /// commit superseded it, the latest commit is read again.
    pub fn open(storage: Arc<dyn Storage>, refs: FileRefs, config: IndexConfig) -> Result<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let commit = CommitDescriptor::read(storage.as_ref())?;
            match IndexReader::bind(Arc::clone(&storage), refs.clone(), config.clone(), commit, &[]) {
                Ok(reader) => return Ok(reader),
                Err(e) if attempt < MAX_OPEN_ATTEMPTS && is_not_found(&e) => {
                    debug!("commit changed while opening reader (attempt {attempt}): {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Build a session on `commit`, reusing payloads from `previous` where
    /// the segment is unchanged.
    fn bind(
        storage: Arc<dyn Storage>,
        refs: FileRefs,
        config: IndexConfig,
        commit: CommitDescriptor,
        previous: &[SegmentReader],
    ) -> Result<Self> {
        let referenced = commit.files(true);
        refs.inc_ref(&referenced);

        let mut segments = Vec::with_capacity(commit.segments.len());
        for descriptor in &commit.segments {
            let prior = previous.iter().find(|s| s.descriptor.name == descriptor.name);
            let opened = match prior {
                Some(prior) if prior.descriptor == *descriptor && !prior.is_dirty() => {
                    Ok(prior.clone())
                }
                Some(prior) => {
                    SegmentReader::open(storage.as_ref(), descriptor, Some(Arc::clone(&prior.data)))
                }
                None => SegmentReader::open(storage.as_ref(), descriptor, None),
            };
            match opened {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    refs.dec_ref(&referenced);
                    return Err(e);
                }
            }
        }

        let mut starts = Vec::with_capacity(segments.len());
        let mut next_start = 0u32;
        for segment in &segments {
            starts.push(next_start);
            next_start += segment.max_doc();
        }

        debug!(
            "reader bound to generation {} ({} segments)",
            commit.generation,
            segments.len()
        );
        Ok(IndexReader {
            storage,
            refs,
            config,
            bound: commit,
            referenced,
            segments,
            starts,
            lock: None,
            state: ReaderState::Opened,
        })
    }

    fn check_closed(&self) -> Result<()> {
        if self.state == ReaderState::Closed {
            Err(TesseraError::already_closed("index reader is closed"))
        } else {
            Ok(())
        }
    }

    /// Whether the bound generation is still the latest. Takes no lock.
    ///
    /// Only a listing is needed unless a newer `segments_N` is present; such
    /// a candidate counts only if it validates, so a reader bound to the
    /// fallback of a corrupt latest commit is current.
    pub fn is_current(&self) -> Result<bool> {
        self.check_closed()?;
        CommitDescriptor::is_latest(self.storage.as_ref(), self.bound.generation)
    }

    /// A new session on the latest commit. Payloads of segments both commits
    /// share are reused.
    pub fn reopen(&self) -> Result<IndexReader> {
        self.check_closed()?;
        if self.has_pending_changes() {
            return Err(TesseraError::invalid_argument(
                "cannot reopen a reader with uncommitted changes",
            ));
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let commit = CommitDescriptor::read(self.storage.as_ref())?;
            let reopened = IndexReader::bind(
                Arc::clone(&self.storage),
                self.refs.clone(),
                self.config.clone(),
                commit,
                &self.segments,
            );
            match reopened {
                Ok(reader) => return Ok(reader),
                Err(e) if attempt < MAX_OPEN_ATTEMPTS && is_not_found(&e) => {
                    debug!("commit changed while reopening reader (attempt {attempt}): {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// [`reopen`](IndexReader::reopen) if a newer commit exists.
    pub fn open_if_changed(&self) -> Result<Option<IndexReader>> {
        if self.is_current()? {
            Ok(None)
        } else {
            self.reopen().map(Some)
        }
    }

    /// Live documents, including staged deletions.
    pub fn num_docs(&self) -> u32 {
        self.segments.iter().map(SegmentReader::num_docs).sum()
    }

    /// One past the highest document id.
    pub fn max_doc(&self) -> u32 {
        self.segments.iter().map(SegmentReader::max_doc).sum()
    }

    pub fn has_deletions(&self) -> bool {
        self.segments.iter().any(|segment| segment.deletions.count() > 0)
    }

    /// Segment index and segment-local id of a global doc id.
    fn locate(&self, doc: u32) -> Result<(usize, u32)> {
        let max_doc = self.max_doc();
        if doc >= max_doc {
            return Err(TesseraError::OutOfRange { doc, max_doc });
        }
        let index = self.starts.partition_point(|&start| start <= doc) - 1;
        Ok((index, doc - self.starts[index]))
    }

    pub fn is_deleted(&self, doc: u32) -> Result<bool> {
        self.check_closed()?;
        let (index, local) = self.locate(doc)?;
        Ok(self.segments[index].deletions.is_deleted(local))
    }

    /// Documents containing `term`, counting deleted ones.
    pub fn doc_freq(&self, term: &Term) -> Result<u32> {
        self.check_closed()?;
        let mut freq = 0;
        for segment in &self.segments {
            if let Some(field_number) = segment.data.field_number(&term.field) {
                freq += segment.data.postings(field_number, &term.text).len() as u32;
            }
        }
        Ok(freq)
    }

    /// Global ids of live documents containing `term`, ascending.
    pub fn term_docs(&self, term: &Term) -> Result<Vec<u32>> {
        self.check_closed()?;
        let mut docs = Vec::new();
        for (segment, &start) in self.segments.iter().zip(&self.starts) {
            let Some(field_number) = segment.data.field_number(&term.field) else {
                continue;
            };
            docs.extend(
                segment
                    .data
                    .postings(field_number, &term.text)
                    .iter()
                    .filter(|&&doc| !segment.deletions.is_deleted(doc))
                    .map(|&doc| start + doc),
            );
        }
        Ok(docs)
    }

    /// Distinct terms of `field` across all segments, ascending.
    pub fn terms(&self, field: &str) -> Result<Vec<String>> {
        self.check_closed()?;
        let mut terms = BTreeSet::new();
        for segment in &self.segments {
            if let Some(field_number) = segment.data.field_number(field) {
                terms.extend(segment.data.terms(field_number).map(str::to_string));
            }
        }
        Ok(terms.into_iter().collect())
    }

    /// Field names present in any segment.
    pub fn fields(&self) -> Vec<String> {
        let fields: BTreeSet<&String> = self
            .segments
            .iter()
            .flat_map(|segment| segment.data.fields())
            .collect();
        fields.into_iter().cloned().collect()
    }

    /// Effective norms of `field` for every document, or `None` if no
    /// segment has the field. Segments without the field contribute zeros.
    pub fn norms(&self, field: &str) -> Result<Option<Vec<u8>>> {
        self.check_closed()?;
        let mut found = false;
        let mut norms = Vec::with_capacity(self.max_doc() as usize);
        for segment in &self.segments {
            match segment
                .data
                .field_number(field)
                .and_then(|field_number| segment.effective_norms(field_number))
            {
                Some(bytes) => {
                    found = true;
                    norms.extend_from_slice(bytes);
                }
                None => norms.resize(norms.len() + segment.max_doc() as usize, 0),
            }
        }
        Ok(found.then_some(norms))
    }

    /// Effective norm of one document's field; 0 if its segment lacks the field.
    pub fn norm(&self, doc: u32, field: &str) -> Result<u8> {
        self.check_closed()?;
        let (index, local) = self.locate(doc)?;
        let segment = &self.segments[index];
        Ok(segment
            .data
            .field_number(field)
            .and_then(|field_number| segment.effective_norms(field_number))
            .and_then(|norms| norms.get(local as usize).copied())
            .unwrap_or(0))
    }

    pub fn generation(&self) -> u64 {
        self.bound.generation
    }

    pub fn version(&self) -> u64 {
        self.bound.version
    }

    /// The commit this session is bound to.
    pub fn descriptor(&self) -> &CommitDescriptor {
        &self.bound
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn has_pending_changes(&self) -> bool {
        self.state == ReaderState::PendingChanges
    }

    /// Obtain the write lock unless held, then verify the bound generation is
    /// still the latest. A stale session gives the lock back.
    ///
    /// Freshness is checked on every call, so a lock cleared with
    /// [`IndexWriter::unlock`](crate::index::IndexWriter::unlock) while held
    /// cannot publish over someone else's commit.
    fn acquire_write_lock(&mut self) -> Result<()> {
        if !self.lock.as_ref().is_some_and(|lock| lock.is_held()) {
            let mut lock = self.storage.make_lock(WRITE_LOCK_NAME);
            lock.obtain(&self.config.lock.retry_policy())?;
            self.lock = Some(lock);
        }

        if let Err(e) = self.check_fresh() {
            self.release_write_lock();
            return Err(e);
        }
        Ok(())
    }

    fn check_fresh(&self) -> Result<()> {
        if CommitDescriptor::is_latest(self.storage.as_ref(), self.bound.generation)? {
            return Ok(());
        }
        let latest = CommitDescriptor::latest_generation(self.storage.as_ref())?;
        Err(TesseraError::stale(format!(
            "reader is bound to generation {}, latest is {}",
            self.bound.generation,
            latest.map_or_else(|| "none".to_string(), |g| g.to_string())
        )))
    }

    fn release_write_lock(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            if lock.is_held() {
                if let Err(e) = lock.release() {
                    warn!("failed to release {WRITE_LOCK_NAME}: {e}");
                }
            }
        }
    }

    /// Stage the deletion of one document.
    pub fn delete_document(&mut self, doc: u32) -> Result<()> {
        self.check_closed()?;
        let (index, local) = self.locate(doc)?;
        self.acquire_write_lock()?;

        let segment = &mut self.segments[index];
        if segment.deletions.delete(local)? {
            segment.deletions_dirty = true;
        }
        self.state = ReaderState::PendingChanges;
        Ok(())
    }

    /// Stage the deletion of every live document containing `term`. Returns
    /// the number of documents deleted. Takes no lock if nothing matches.
    pub fn delete_documents(&mut self, term: &Term) -> Result<u32> {
        let docs = self.term_docs(term)?;
        if docs.is_empty() {
            return Ok(0);
        }
        self.acquire_write_lock()?;

        let mut deleted = 0;
        for doc in docs {
            let (index, local) = self.locate(doc)?;
            let segment = &mut self.segments[index];
            if segment.deletions.delete(local)? {
                segment.deletions_dirty = true;
                deleted += 1;
            }
        }
        self.state = ReaderState::PendingChanges;
        Ok(deleted)
    }

    /// Stage a norm change for one document's field.
    pub fn set_norm(&mut self, doc: u32, field: &str, value: u8) -> Result<()> {
        self.check_closed()?;
        let (index, local) = self.locate(doc)?;
        let field_number = self.segments[index].data.field_number(field).ok_or_else(|| {
            TesseraError::invalid_argument(format!(
                "field {field} is not indexed in segment {}",
                self.segments[index].descriptor.name
            ))
        })?;
        self.acquire_write_lock()?;

        let segment = &mut self.segments[index];
        if !segment.norms.contains_key(&field_number) {
            let base = segment.data.base_norms(field_number).unwrap_or(&[]).to_vec();
            segment.norms.insert(field_number, base);
        }
        if let Some(norms) = segment.norms.get_mut(&field_number) {
            norms[local as usize] = value;
        }
        segment.dirty_norms.insert(field_number);
        self.state = ReaderState::PendingChanges;
        Ok(())
    }

    /// [`set_norm`](IndexReader::set_norm) with an encoded float.
    pub fn set_norm_f32(&mut self, doc: u32, field: &str, value: f32) -> Result<()> {
        self.set_norm(doc, field, encode_norm(value))
    }

    /// Stage the removal of every deletion. The next commit writes an empty
    /// deletion generation for each affected segment.
    ///
    /// Takes the write lock and checks freshness like every other mutation,
    /// even when there is nothing to undelete.
    pub fn undelete_all(&mut self) -> Result<()> {
        self.check_closed()?;
        self.acquire_write_lock()?;

        for segment in &mut self.segments {
            if segment.deletions.count() > 0 {
                segment.deletions.clear();
                segment.deletions_dirty = true;
            }
        }
        self.state = ReaderState::PendingChanges;
        Ok(())
    }

    /// Publish staged changes as a new commit and re-bind to it.
    ///
    /// Only touched segments get new generation files. On failure the files
    /// written are removed, the lock is released and the changes stay staged;
    /// a retry re-acquires the lock and checks freshness again.
    pub fn commit(&mut self) -> Result<()> {
        self.check_closed()?;
        if !self.has_pending_changes() {
            return Ok(());
        }
        if !self.segments.iter().any(SegmentReader::is_dirty) {
            self.release_write_lock();
            self.state = ReaderState::Committed;
            return Ok(());
        }

        self.acquire_write_lock()?;

        let mut next = self.bound.clone();
        let mut written = Vec::new();
        let published = self
            .write_generations(&mut next, &mut written)
            .and_then(|_| next.write(self.storage.as_ref()));
        if let Err(e) = published {
            deleter::discard_files(self.storage.as_ref(), &written);
            self.release_write_lock();
            return Err(e);
        }

        let referenced = next.files(true);
        self.refs.inc_ref(&referenced);
        self.refs.dec_ref(&self.referenced);
        self.referenced = referenced;

        for (segment, descriptor) in self.segments.iter_mut().zip(&next.segments) {
            segment.descriptor = descriptor.clone();
            if let Some(generation) = descriptor.del_generation {
                segment.deletions.generation = generation;
            }
            segment.deletions_dirty = false;
            segment.dirty_norms.clear();
        }
        info!(
            "reader committed generation {} ({} files written)",
            next.generation,
            written.len()
        );
        self.bound = next;

        if let Err(e) = FileDeleter::new(self.storage.as_ref(), &self.refs).run(&self.bound) {
            warn!("file deleter pass failed: {e}");
        }
        self.release_write_lock();
        self.state = ReaderState::Committed;
        Ok(())
    }

    fn write_generations(
        &self,
        next: &mut CommitDescriptor,
        written: &mut Vec<String>,
    ) -> Result<()> {
        let storage = self.storage.as_ref();
        for (segment, descriptor) in self.segments.iter().zip(next.segments.iter_mut()) {
            if segment.deletions_dirty {
                let mut bitmap = segment.deletions.clone();
                bitmap.generation = descriptor.next_del_generation();
                deleter::clear_leftover(storage, &bitmap.file_name())?;
                written.push(bitmap.write(storage)?);
                descriptor.del_generation = Some(bitmap.generation);
                descriptor.del_count = bitmap.count();
            }

            let mut norm_generations = BTreeMap::new();
            for &field_number in &segment.dirty_norms {
                let Some(bytes) = segment.norms.get(&field_number) else {
                    continue;
                };
                let generation = descriptor.next_norm_generation(field_number);
                let blob = NormsBlob::new(&descriptor.name, field_number, generation, bytes.clone());
                deleter::clear_leftover(storage, &blob.file_name())?;
                written.push(blob.write(storage)?);
                norm_generations.insert(field_number, generation);
            }
            descriptor.norm_generations.extend(norm_generations);
        }
        Ok(())
    }

    /// Commit staged changes, release file references and close.
    ///
    /// If the commit fails the staged changes are discarded, the session is
    /// still closed and the commit error is returned.
    pub fn close(&mut self) -> Result<()> {
        self.check_closed()?;
        let committed = self.commit();
        if let Err(e) = &committed {
            warn!("discarding uncommitted reader changes: {e}");
        }
        self.release_write_lock();
        self.refs.dec_ref(&self.referenced);
        self.referenced.clear();
        self.state = ReaderState::Closed;

        self.collect_garbage_if_unlocked();
        committed
    }

    /// Reclaim files this session no longer pins, if the write lock is free.
    fn collect_garbage_if_unlocked(&self) {
        let mut lock = self.storage.make_lock(WRITE_LOCK_NAME);
        match lock.obtain(&LockRetryPolicy::no_wait()) {
            Ok(()) => {}
            Err(_) => return,
        }
        match CommitDescriptor::read(self.storage.as_ref()) {
            Ok(latest) => {
                if let Err(e) = FileDeleter::new(self.storage.as_ref(), &self.refs).run(&latest) {
                    warn!("file deleter pass failed: {e}");
                }
            }
            Err(e) => debug!("skipping deleter pass on close: {e}"),
        }
        if let Err(e) = lock.release() {
            warn!("failed to release {WRITE_LOCK_NAME}: {e}");
        }
    }
}

impl Drop for IndexReader {
    fn drop(&mut self) {
        if self.state == ReaderState::Closed {
            return;
        }
        if self.has_pending_changes() {
            debug!("reader dropped with uncommitted changes");
        }
        self.release_write_lock();
        self.refs.dec_ref(&self.referenced);
    }
}
