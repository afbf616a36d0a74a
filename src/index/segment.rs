//! Segment descriptors and segment payloads.
//!
//! A [`SegmentDescriptor`] is what a commit records about a segment: its
//! name, size, and which deletion and norms generations are current. The
//! payload itself ([`SegmentData`]) is immutable once flushed: per-field term
//! postings plus the length-derived base norms. Non-compound segments store
//! the two parts as `<seg>.seg` and `<seg>.nrm`; compound segments store both
//! in a single `<seg>.cfs`.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::document::Document;
use crate::error::{Result, TesseraError};
use crate::index::deleter;
use crate::index::deletes::DeletionBitmap;
use crate::index::file_names::{
    self, BASE_NORMS_EXTENSION, COMPOUND_EXTENSION, POSTINGS_EXTENSION,
};
use crate::index::norms::length_norm;
use crate::storage::structured::{StructReader, StructWriter, open_file, write_file};
use crate::storage::{Storage, StorageInput, StorageOutput};

const POSTINGS_MAGIC: u32 = 0x54534547; // "TSEG"
const BASE_NORMS_MAGIC: u32 = 0x544E524D; // "TNRM"
const COMPOUND_MAGIC: u32 = 0x54434653; // "TCFS"
const SEGMENT_FORMAT: u32 = 1;

/// What a commit records about one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub name: String,
    pub doc_count: u32,
    /// Current deletion generation, `None` if deletions were never written.
    pub del_generation: Option<u64>,
    /// Deleted documents in the current deletion generation.
    pub del_count: u32,
    /// Current norms generation per field number. Fields without an entry
    /// use the segment's base norms.
    pub norm_generations: BTreeMap<u32, u64>,
    pub is_compound: bool,
}

impl SegmentDescriptor {
    pub fn new(name: &str, doc_count: u32, is_compound: bool) -> Self {
        SegmentDescriptor {
            name: name.to_string(),
            doc_count,
            del_generation: None,
            del_count: 0,
            norm_generations: BTreeMap::new(),
            is_compound,
        }
    }

    pub fn has_deletions(&self) -> bool {
        self.del_count > 0
    }

    /// Live documents.
    pub fn num_docs(&self) -> u32 {
        self.doc_count - self.del_count
    }

    /// Generation the next deletion file must be written as.
    pub fn next_del_generation(&self) -> u64 {
        self.del_generation.map_or(1, |generation| generation + 1)
    }

    /// Generation the next norms file for `field_number` must be written as.
    pub fn next_norm_generation(&self, field_number: u32) -> u64 {
        self.norm_generations
            .get(&field_number)
            .map_or(1, |generation| generation + 1)
    }

    /// Payload files, without generation files.
    pub fn data_files(&self) -> Vec<String> {
        if self.is_compound {
            vec![file_names::segment_file_name(&self.name, COMPOUND_EXTENSION)]
        } else {
            vec![
                file_names::segment_file_name(&self.name, POSTINGS_EXTENSION),
                file_names::segment_file_name(&self.name, BASE_NORMS_EXTENSION),
            ]
        }
    }

    /// Every file this descriptor references.
    pub fn files(&self) -> Vec<String> {
        let mut files = self.data_files();
        if let Some(generation) = self.del_generation {
            files.push(file_names::deletes_file_name(&self.name, generation));
        }
        for (&field_number, &generation) in &self.norm_generations {
            files.push(file_names::norms_file_name(&self.name, field_number, generation));
        }
        files
    }

    pub(crate) fn write_to<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_u32(self.doc_count)?;
        writer.write_u64(self.del_generation.unwrap_or(0))?;
        writer.write_u32(self.del_count)?;
        writer.write_bool(self.is_compound)?;
        writer.write_varint(self.norm_generations.len() as u64)?;
        for (&field_number, &generation) in &self.norm_generations {
            writer.write_varint(field_number as u64)?;
            writer.write_varint(generation)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self> {
        let name = reader.read_string()?;
        if file_names::segment_counter(&name).is_none() {
            return Err(reader.invalid(format!("invalid segment name {name:?}")));
        }
        let doc_count = reader.read_u32()?;
        let del_generation = match reader.read_u64()? {
            0 => None,
            generation => Some(generation),
        };
        let del_count = reader.read_u32()?;
        if del_count > doc_count || (del_generation.is_none() && del_count > 0) {
            return Err(reader.invalid(format!(
                "segment {name}: {del_count} deletions for {doc_count} documents"
            )));
        }
        let is_compound = reader.read_bool()?;
        let norm_count = reader.read_varint()?;
        let mut norm_generations = BTreeMap::new();
        for _ in 0..norm_count {
            let field_number = reader.read_varint_u32()?;
            let generation = reader.read_varint()?;
            if generation == 0 {
                return Err(reader.invalid(format!("segment {name}: norms generation 0")));
            }
            norm_generations.insert(field_number, generation);
        }

        Ok(SegmentDescriptor {
            name,
            doc_count,
            del_generation,
            del_count,
            norm_generations,
            is_compound,
        })
    }
}

/// Per-field postings: term text to ascending doc ids.
type Postings = BTreeMap<String, Vec<u32>>;

/// The immutable payload of a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentData {
    doc_count: u32,
    /// Field names; the position is the field number.
    fields: Vec<String>,
    postings: Vec<Postings>,
    /// Base norms, one byte per document, per field.
    norms: Vec<Vec<u8>>,
}

/// One input of [`SegmentData::merge`].
#[derive(Debug)]
pub struct MergeSource<'a> {
    pub data: &'a SegmentData,
    pub deletions: Option<&'a DeletionBitmap>,
    /// Norms overriding the base norms, by field number.
    pub norm_overrides: BTreeMap<u32, Vec<u8>>,
}

struct SegmentBuilder {
    doc_count: u32,
    field_numbers: AHashMap<String, usize>,
    data: SegmentData,
}

impl SegmentBuilder {
    fn new() -> Self {
        SegmentBuilder {
            doc_count: 0,
            field_numbers: AHashMap::new(),
            data: SegmentData::default(),
        }
    }

    fn field(&mut self, name: &str) -> usize {
        if let Some(&number) = self.field_numbers.get(name) {
            return number;
        }
        let number = self.data.fields.len();
        self.data.fields.push(name.to_string());
        self.data.postings.push(Postings::new());
        self.data.norms.push(vec![0; self.doc_count as usize]);
        self.field_numbers.insert(name.to_string(), number);
        number
    }

    /// Start a new document; every field's norm defaults to 0.
    fn next_doc(&mut self) -> u32 {
        let doc = self.doc_count;
        self.doc_count += 1;
        for norms in &mut self.data.norms {
            norms.push(0);
        }
        doc
    }

    fn add_posting(&mut self, field: usize, term: &str, doc: u32) {
        let docs = self.data.postings[field].entry(term.to_string()).or_default();
        if docs.last() != Some(&doc) {
            docs.push(doc);
        }
    }

    fn build(mut self) -> SegmentData {
        self.data.doc_count = self.doc_count;
        self.data
    }
}

impl SegmentData {
    /// Build a segment from documents; document `i` gets id `i`.
    pub fn from_documents(documents: &[Document]) -> SegmentData {
        let mut builder = SegmentBuilder::new();
        for document in documents {
            let doc = builder.next_doc();
            for field in document.fields() {
                let number = builder.field(&field.name);
                for term in &field.terms {
                    builder.add_posting(number, term, doc);
                }
                builder.data.norms[number][doc as usize] = length_norm(field.terms.len());
            }
        }
        builder.build()
    }

    /// Concatenate `sources`, dropping deleted documents and renumbering the
    /// survivors densely in source order. Effective norms (overrides where
    /// present) become the merged segment's base norms.
    pub fn merge(sources: &[MergeSource<'_>]) -> SegmentData {
        let mut builder = SegmentBuilder::new();

        for source in sources {
            let data = source.data;
            let numbers: Vec<usize> = data.fields.iter().map(|name| builder.field(name)).collect();

            // Old id to new id for live documents.
            let mut doc_map = vec![None; data.doc_count as usize];
            for (old, slot) in doc_map.iter_mut().enumerate() {
                let old = old as u32;
                if source.deletions.is_some_and(|deletions| deletions.is_deleted(old)) {
                    continue;
                }
                let new = builder.next_doc();
                *slot = Some(new);
                for (field, &number) in numbers.iter().enumerate() {
                    let norms = source
                        .norm_overrides
                        .get(&(field as u32))
                        .unwrap_or(&data.norms[field]);
                    builder.data.norms[number][new as usize] =
                        norms.get(old as usize).copied().unwrap_or(0);
                }
            }

            for (field, postings) in data.postings.iter().enumerate() {
                for (term, docs) in postings {
                    for &old in docs {
                        if let Some(new) = doc_map.get(old as usize).copied().flatten() {
                            builder.add_posting(numbers[field], term, new);
                        }
                    }
                }
            }
        }

        builder.build()
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Field names in field-number order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_number(&self, name: &str) -> Option<u32> {
        self.fields.iter().position(|field| field == name).map(|n| n as u32)
    }

    /// Doc ids containing `term` in field `field_number`, including deleted ones.
    pub fn postings(&self, field_number: u32, term: &str) -> &[u32] {
        self.postings
            .get(field_number as usize)
            .and_then(|postings| postings.get(term))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Terms of a field in ascending order.
    pub fn terms(&self, field_number: u32) -> impl Iterator<Item = &str> + '_ {
        self.postings
            .get(field_number as usize)
            .into_iter()
            .flat_map(|postings| postings.keys().map(String::as_str))
    }

    /// Base norms of a field.
    pub fn base_norms(&self, field_number: u32) -> Option<&[u8]> {
        self.norms.get(field_number as usize).map(Vec::as_slice)
    }

    /// Write the payload for `descriptor`. Returns the files created.
    ///
    /// On failure every file this call created is removed again.
    pub fn write(&self, storage: &dyn Storage, descriptor: &SegmentDescriptor) -> Result<Vec<String>> {
        if descriptor.doc_count != self.doc_count {
            return Err(TesseraError::invalid_argument(format!(
                "descriptor {} has {} documents, payload has {}",
                descriptor.name, descriptor.doc_count, self.doc_count
            )));
        }
        let segment = descriptor.name.as_str();

        if descriptor.is_compound {
            let name = file_names::segment_file_name(segment, COMPOUND_EXTENSION);
            write_file(storage, &name, |writer| {
                writer.write_u32(COMPOUND_MAGIC)?;
                writer.write_u32(SEGMENT_FORMAT)?;
                writer.write_string(segment)?;
                self.write_postings(writer)?;
                self.write_norms(writer)
            })?;
            return Ok(vec![name]);
        }

        let postings = file_names::segment_file_name(segment, POSTINGS_EXTENSION);
        write_file(storage, &postings, |writer| {
            writer.write_u32(POSTINGS_MAGIC)?;
            writer.write_u32(SEGMENT_FORMAT)?;
            writer.write_string(segment)?;
            self.write_postings(writer)
        })?;

        let norms = file_names::segment_file_name(segment, BASE_NORMS_EXTENSION);
        let written = write_file(storage, &norms, |writer| {
            writer.write_u32(BASE_NORMS_MAGIC)?;
            writer.write_u32(SEGMENT_FORMAT)?;
            writer.write_string(segment)?;
            self.write_norms(writer)
        });
        if let Err(e) = written {
            deleter::discard_files(storage, [&postings]);
            return Err(e);
        }

        Ok(vec![postings, norms])
    }

    fn write_postings<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_u32(self.doc_count)?;
        writer.write_varint(self.fields.len() as u64)?;
        for (name, postings) in self.fields.iter().zip(&self.postings) {
            writer.write_string(name)?;
            writer.write_varint(postings.len() as u64)?;
            for (term, docs) in postings {
                writer.write_string(term)?;
                writer.write_delta_compressed_u32s(docs)?;
            }
        }
        Ok(())
    }

    fn write_norms<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_varint(self.norms.len() as u64)?;
        for norms in &self.norms {
            writer.write_bytes(norms)?;
        }
        Ok(())
    }

    /// Read the payload of `descriptor`.
    pub fn read(storage: &dyn Storage, descriptor: &SegmentDescriptor) -> Result<SegmentData> {
        let segment = descriptor.name.as_str();
        let mut data = SegmentData::default();

        if descriptor.is_compound {
            let name = file_names::segment_file_name(segment, COMPOUND_EXTENSION);
            let mut reader = open_file(storage, &name)?;
            read_header(&mut reader, COMPOUND_MAGIC, segment)?;
            data.read_postings(&mut reader)?;
            data.read_norms(&mut reader)?;
            reader.finish()?;
        } else {
            let name = file_names::segment_file_name(segment, POSTINGS_EXTENSION);
            let mut reader = open_file(storage, &name)?;
            read_header(&mut reader, POSTINGS_MAGIC, segment)?;
            data.read_postings(&mut reader)?;
            reader.finish()?;

            let name = file_names::segment_file_name(segment, BASE_NORMS_EXTENSION);
            let mut reader = open_file(storage, &name)?;
            read_header(&mut reader, BASE_NORMS_MAGIC, segment)?;
            data.read_norms(&mut reader)?;
            reader.finish()?;
        }

        if data.doc_count != descriptor.doc_count {
            return Err(TesseraError::corrupt(format!(
                "segment {segment}: payload has {} documents, commit says {}",
                data.doc_count, descriptor.doc_count
            )));
        }
        Ok(data)
    }

    fn read_postings<R: StorageInput>(&mut self, reader: &mut StructReader<R>) -> Result<()> {
        self.doc_count = reader.read_u32()?;
        let field_count = reader.read_varint()?;
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let term_count = reader.read_varint()?;
            let mut postings = Postings::new();
            for _ in 0..term_count {
                let term = reader.read_string()?;
                let docs = reader.read_delta_compressed_u32s()?;
                if docs.iter().any(|&doc| doc >= self.doc_count)
                    || docs.windows(2).any(|pair| pair[0] >= pair[1])
                {
                    return Err(reader.invalid(format!("bad postings for {name}:{term}")));
                }
                postings.insert(term, docs);
            }
            self.fields.push(name);
            self.postings.push(postings);
        }
        Ok(())
    }

    fn read_norms<R: StorageInput>(&mut self, reader: &mut StructReader<R>) -> Result<()> {
        let field_count = reader.read_varint()?;
        if field_count != self.fields.len() as u64 {
            return Err(reader.invalid(format!(
                "norms for {field_count} fields, postings for {}",
                self.fields.len()
            )));
        }
        for _ in 0..field_count {
            let norms = reader.read_bytes()?;
            if norms.len() != self.doc_count as usize {
                return Err(reader.invalid("norms length does not match document count"));
            }
            self.norms.push(norms);
        }
        Ok(())
    }
}

fn read_header<R: StorageInput>(reader: &mut StructReader<R>, magic: u32, segment: &str) -> Result<()> {
    if reader.read_u32()? != magic {
        return Err(reader.invalid("bad segment magic"));
    }
    let format = reader.read_u32()?;
    if format != SEGMENT_FORMAT {
        return Err(reader.invalid(format!("unsupported segment format {format}")));
    }
    let stored = reader.read_string()?;
    if stored != segment {
        return Err(reader.invalid(format!("belongs to segment {stored}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::norms::encode_norm;
    use crate::storage::memory::MemoryStorage;

    fn docs() -> Vec<Document> {
        vec![
            Document::builder().add_text("body", "a b a").build(),
            Document::builder().add_text("body", "b c").add_text("title", "x").build(),
            Document::builder().add_text("title", "x y").build(),
        ]
    }

    #[test]
    fn test_from_documents() {
        let data = SegmentData::from_documents(&docs());
        assert_eq!(data.doc_count(), 3);
        assert_eq!(data.fields(), &["body".to_string(), "title".to_string()]);

        let body = data.field_number("body").unwrap();
        let title = data.field_number("title").unwrap();
        assert_eq!(data.postings(body, "a"), &[0]);
        assert_eq!(data.postings(body, "b"), &[0, 1]);
        assert_eq!(data.postings(title, "x"), &[1, 2]);
        assert!(data.postings(body, "zzz").is_empty());
        assert!(data.postings(9, "a").is_empty());
        assert_eq!(data.terms(body).collect::<Vec<_>>(), vec!["a", "b", "c"]);

        // Field absent in a document has norm 0.
        assert_eq!(data.base_norms(title).unwrap()[0], 0);
        assert_eq!(data.base_norms(title).unwrap()[1], encode_norm(1.0));
        assert_eq!(data.base_norms(body).unwrap()[2], 0);
    }

    #[test]
    fn test_merge_drops_deleted_and_applies_overrides() {
        let first = SegmentData::from_documents(&docs());
        let second = SegmentData::from_documents(&[Document::builder()
            .add_text("other", "z")
            .add_text("body", "a")
            .build()]);

        let mut deletions = DeletionBitmap::new("_0", 3);
        deletions.delete(0).unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert(1, vec![10, 20, 30]);

        let merged = SegmentData::merge(&[
            MergeSource {
                data: &first,
                deletions: Some(&deletions),
                norm_overrides: overrides,
            },
            MergeSource {
                data: &second,
                deletions: None,
                norm_overrides: BTreeMap::new(),
            },
        ]);

        assert_eq!(merged.doc_count(), 3);
        let body = merged.field_number("body").unwrap();
        let title = merged.field_number("title").unwrap();
        let other = merged.field_number("other").unwrap();
        assert_eq!(merged.postings(body, "a"), &[2]);
        assert_eq!(merged.postings(body, "b"), &[0]);
        assert_eq!(merged.postings(title, "x"), &[0, 1]);
        assert_eq!(merged.postings(other, "z"), &[2]);
        assert_eq!(merged.base_norms(title).unwrap(), &[20, 30, 0]);
    }

    #[test]
    fn test_write_read_both_layouts() {
        let storage = MemoryStorage::new_default();
        let data = SegmentData::from_documents(&docs());

        for (name, compound) in [("_0", false), ("_1", true)] {
            let descriptor = SegmentDescriptor::new(name, 3, compound);
            let files = data.write(&storage, &descriptor).unwrap();
            assert_eq!(files, descriptor.data_files());
            assert_eq!(SegmentData::read(&storage, &descriptor).unwrap(), data);
        }

        let wrong = SegmentDescriptor::new("_0", 4, false);
        assert!(matches!(
            SegmentData::read(&storage, &wrong),
            Err(TesseraError::CorruptIndex(_))
        ));
        assert!(data.write(&storage, &wrong).is_err());
    }

    #[test]
    fn test_failed_norms_write_removes_postings() {
        use crate::storage::fault::FaultInjectingStorage;
        use std::sync::Arc;

        let data = SegmentData::from_documents(&docs());
        let descriptor = SegmentDescriptor::new("_0", 3, false);
        let sizing = MemoryStorage::new_default();
        data.write(&sizing, &descriptor).unwrap();
        let postings_len = sizing.file_size("_0.seg").unwrap();

        let inner = Arc::new(MemoryStorage::new_default());
        let storage = FaultInjectingStorage::new(inner.clone(), 1);
        storage.set_max_size(Some(postings_len + 1));
        let err = data.write(&storage, &descriptor).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(!inner.file_exists("_0.seg"));
        assert!(!inner.file_exists("_0.nrm"));
    }

    #[test]
    fn test_descriptor_files_and_generations() {
        let mut descriptor = SegmentDescriptor::new("_4", 10, false);
        assert_eq!(descriptor.next_del_generation(), 1);
        assert!(!descriptor.has_deletions());

        descriptor.del_generation = Some(2);
        descriptor.del_count = 3;
        descriptor.norm_generations.insert(1, 5);
        assert!(descriptor.has_deletions());
        assert_eq!(descriptor.num_docs(), 7);
        assert_eq!(descriptor.next_del_generation(), 3);
        assert_eq!(descriptor.next_norm_generation(1), 6);
        assert_eq!(descriptor.next_norm_generation(0), 1);
        assert_eq!(
            descriptor.files(),
            vec!["_4.seg", "_4.nrm", "_4_2.del", "_4_5.s1"]
        );
    }
}
