//! Deletion bitmaps and their generation files.
//!
//! A segment's deletions live in `<segment>_<gen>.del`, a complete bitmap of
//! the segment (bit set = deleted). New deletions are written as generation
//! G+1 next to G; G is reclaimed by the file deleter once no commit or open
//! session references it.

use bit_vec::BitVec;

use crate::error::{Result, TesseraError};
use crate::index::file_names;
use crate::index::segment::SegmentDescriptor;
use crate::storage::Storage;
use crate::storage::structured::{open_file, write_file};

const DELETES_MAGIC: u32 = 0x44454C42; // "DELB"
const DELETES_FORMAT: u32 = 1;

/// A bitmap-based deletion tracker for a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionBitmap {
    /// Segment this bitmap belongs to.
    pub segment: String,

    /// Generation the bitmap was read from or will be written as.
    pub generation: u64,

    /// Bit set = deleted.
    bits: BitVec,

    /// Number of set bits.
    count: u32,
}

impl DeletionBitmap {
    /// An empty bitmap covering `doc_count` documents.
    pub fn new(segment: &str, doc_count: u32) -> Self {
        DeletionBitmap {
            segment: segment.to_string(),
            generation: 0,
            bits: BitVec::from_elem(doc_count as usize, false),
            count: 0,
        }
    }

    /// Number of documents covered.
    pub fn doc_count(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Number of deleted documents.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Mark `doc` deleted. Returns `true` if it was live before.
    pub fn delete(&mut self, doc: u32) -> Result<bool> {
        if doc >= self.doc_count() {
            return Err(TesseraError::OutOfRange {
                doc,
                max_doc: self.doc_count(),
            });
        }
        if self.bits.get(doc as usize).unwrap_or(false) {
            return Ok(false);
        }
        self.bits.set(doc as usize, true);
        self.count += 1;
        Ok(true)
    }

    pub fn is_deleted(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Forget every deletion.
    pub fn clear(&mut self) {
        self.bits = BitVec::from_elem(self.bits.len(), false);
        self.count = 0;
    }

    /// Ids of deleted documents in ascending order.
    pub fn deleted_docs(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, deleted)| *deleted)
            .map(|(doc, _)| doc as u32)
    }

    pub fn file_name(&self) -> String {
        file_names::deletes_file_name(&self.segment, self.generation)
    }

    /// Write this bitmap as generation `self.generation`. Fails rather than
    /// overwrite an existing generation.
    pub fn write(&self, storage: &dyn Storage) -> Result<String> {
        let name = self.file_name();
        if storage.file_exists(&name) {
            return Err(TesseraError::storage(format!(
                "deletion generation {name} already exists"
            )));
        }

        write_file(storage, &name, |writer| {
            writer.write_u32(DELETES_MAGIC)?;
            writer.write_u32(DELETES_FORMAT)?;
            writer.write_string(&self.segment)?;
            writer.write_u32(self.doc_count())?;
            writer.write_u32(self.count)?;
            writer.write_bytes(&self.bits.to_bytes())
        })?;
        Ok(name)
    }

    /// Read generation `generation` of `segment`'s deletions.
    pub fn read(
        storage: &dyn Storage,
        segment: &str,
        generation: u64,
        doc_count: u32,
    ) -> Result<DeletionBitmap> {
        let name = file_names::deletes_file_name(segment, generation);
        let mut reader = open_file(storage, &name)?;

        if reader.read_u32()? != DELETES_MAGIC {
            return Err(reader.invalid("bad deletion bitmap magic"));
        }
        let format = reader.read_u32()?;
        if format != DELETES_FORMAT {
            return Err(reader.invalid(format!("unsupported deletion format {format}")));
        }
        let stored_segment = reader.read_string()?;
        if stored_segment != segment {
            return Err(reader.invalid(format!("belongs to segment {stored_segment}")));
        }
        let stored_docs = reader.read_u32()?;
        if stored_docs != doc_count {
            return Err(reader.invalid(format!(
                "covers {stored_docs} documents, segment has {doc_count}"
            )));
        }
        let stored_count = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        if bytes.len() != (doc_count as usize).div_ceil(8) {
            return Err(reader.invalid(format!("bitmap of {} bytes", bytes.len())));
        }
        reader.finish()?;

        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(doc_count as usize);
        let count = bits.iter().filter(|deleted| *deleted).count() as u32;
        if count != stored_count {
            return Err(TesseraError::corrupt(format!(
                "{name}: {count} deleted bits, header says {stored_count}"
            )));
        }

        Ok(DeletionBitmap {
            segment: segment.to_string(),
            generation,
            bits,
            count,
        })
    }

    /// The deletions a descriptor names, or an empty bitmap if it names none.
    pub fn for_segment(storage: &dyn Storage, descriptor: &SegmentDescriptor) -> Result<DeletionBitmap> {
        match descriptor.del_generation {
            Some(generation) => {
                DeletionBitmap::read(storage, &descriptor.name, generation, descriptor.doc_count)
            }
            None => Ok(DeletionBitmap::new(&descriptor.name, descriptor.doc_count)),
        }
    }
}
