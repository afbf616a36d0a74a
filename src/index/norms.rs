//! Per-document, per-field norms.
//!
//! A norm is one byte per document: a scoring scalar squeezed into a tiny
//! float with a 3-bit mantissa and a 5-bit exponent (zero point 15). Base
//! norms are derived from field length when a segment is flushed; overrides
//! are written as norms generation files `<segment>_<gen>.s<field>`, each a
//! complete copy of the field's norms for that segment.

use std::collections::BTreeMap;

use crate::error::{Result, TesseraError};
use crate::index::file_names;
use crate::index::segment::SegmentDescriptor;
use crate::storage::Storage;
use crate::storage::structured::{open_file, write_file};

const NORMS_MAGIC: u32 = 0x4E524D53; // "NRMS"
const NORMS_FORMAT: u32 = 1;

const MANTISSA_BITS: i32 = 3;
const ZERO_EXP: i32 = 15;
const ZERO_POINT: i32 = (63 - ZERO_EXP) << MANTISSA_BITS;

/// Encode a float into a norm byte. Values are truncated; negatives and
/// values below the smallest positive norm map to 0 or 1, overflow to 255.
pub fn encode_norm(value: f32) -> u8 {
    let bits = value.to_bits() as i32;
    let small = bits >> (24 - MANTISSA_BITS);
    if small <= ZERO_POINT {
        return if bits <= 0 { 0 } else { 1 };
    }
    if small >= ZERO_POINT + 0x100 {
        return 255;
    }
    (small - ZERO_POINT) as u8
}

/// Decode a norm byte.
pub fn decode_norm(byte: u8) -> f32 {
    if byte == 0 {
        return 0.0;
    }
    let mut bits = (byte as i32) << (24 - MANTISSA_BITS);
    bits += (63 - ZERO_EXP) << 24;
    f32::from_bits(bits as u32)
}

/// Length-derived norm of a field holding `num_terms` terms.
pub fn length_norm(num_terms: usize) -> u8 {
    if num_terms == 0 {
        return 0;
    }
    encode_norm(1.0 / (num_terms as f32).sqrt())
}

/// One generation of a field's norms for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormsBlob {
    pub segment: String,
    pub field_number: u32,
    pub generation: u64,
    pub bytes: Vec<u8>,
}

impl NormsBlob {
    pub fn new(segment: &str, field_number: u32, generation: u64, bytes: Vec<u8>) -> Self {
        NormsBlob {
            segment: segment.to_string(),
            field_number,
            generation,
            bytes,
        }
    }

    pub fn file_name(&self) -> String {
        file_names::norms_file_name(&self.segment, self.field_number, self.generation)
    }

    /// Write this generation. Fails rather than overwrite an existing file.
    pub fn write(&self, storage: &dyn Storage) -> Result<String> {
        let name = self.file_name();
        if storage.file_exists(&name) {
            return Err(TesseraError::storage(format!(
                "norms generation {name} already exists"
            )));
        }

        write_file(storage, &name, |writer| {
            writer.write_u32(NORMS_MAGIC)?;
            writer.write_u32(NORMS_FORMAT)?;
            writer.write_string(&self.segment)?;
            writer.write_varint(self.field_number as u64)?;
            writer.write_bytes(&self.bytes)
        })?;
        Ok(name)
    }

    /// Read the norms generation a descriptor names, checking it covers
    /// exactly `doc_count` documents.
    pub fn read(
        storage: &dyn Storage,
        segment: &str,
        field_number: u32,
        generation: u64,
        doc_count: u32,
    ) -> Result<NormsBlob> {
        let name = file_names::norms_file_name(segment, field_number, generation);
        let mut reader = open_file(storage, &name)?;

        if reader.read_u32()? != NORMS_MAGIC {
            return Err(reader.invalid("bad norms magic"));
        }
        let format = reader.read_u32()?;
        if format != NORMS_FORMAT {
            return Err(reader.invalid(format!("unsupported norms format {format}")));
        }
        let stored_segment = reader.read_string()?;
        let stored_field = reader.read_varint_u32()?;
        if stored_segment != segment || stored_field != field_number {
            return Err(reader.invalid(format!(
                "belongs to {stored_segment} field {stored_field}"
            )));
        }
        let bytes = reader.read_bytes()?;
        if bytes.len() != doc_count as usize {
            return Err(reader.invalid(format!(
                "{} norms for {doc_count} documents",
                bytes.len()
            )));
        }
        reader.finish()?;

        Ok(NormsBlob::new(segment, field_number, generation, bytes))
    }

    /// Every norms override a descriptor names, by field number.
    pub fn read_overrides(
        storage: &dyn Storage,
        descriptor: &SegmentDescriptor,
    ) -> Result<BTreeMap<u32, Vec<u8>>> {
        let mut overrides = BTreeMap::new();
        for (&field_number, &generation) in &descriptor.norm_generations {
            let blob = NormsBlob::read(
                storage,
                &descriptor.name,
                field_number,
                generation,
                descriptor.doc_count,
            )?;
            overrides.insert(field_number, blob.bytes);
        }
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode_norm(0.0), 0);
        assert_eq!(encode_norm(-1.0), 0);
        assert_eq!(encode_norm(1.0), 124);
        assert_eq!(decode_norm(124), 1.0);
        assert_eq!(decode_norm(0), 0.0);
        assert_eq!(encode_norm(f32::MAX), 255);
        assert_eq!(encode_norm(f32::MIN_POSITIVE), 1);

        // Every byte survives a decode/encode cycle.
        for byte in 1..=255u8 {
            assert_eq!(encode_norm(decode_norm(byte)), byte);
        }
    }

    #[test]
    fn test_length_norm_decreases() {
        assert_eq!(length_norm(0), 0);
        assert_eq!(length_norm(1), encode_norm(1.0));
        assert!(length_norm(4) < length_norm(1));
        assert!(decode_norm(length_norm(4)) <= 0.5);
    }

    #[test]
    fn test_write_read_generation() {
        let storage = MemoryStorage::new_default();
        let blob = NormsBlob::new("_0", 1, 2, vec![124, 0, 7]);
        assert_eq!(blob.write(&storage).unwrap(), "_0_2.s1");

        let read = NormsBlob::read(&storage, "_0", 1, 2, 3).unwrap();
        assert_eq!(read, blob);

        assert!(matches!(
            NormsBlob::read(&storage, "_0", 1, 2, 4),
            Err(TesseraError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_generation_is_never_overwritten() {
        let storage = MemoryStorage::new_default();
        NormsBlob::new("_0", 0, 1, vec![1]).write(&storage).unwrap();
        assert!(NormsBlob::new("_0", 0, 1, vec![2]).write(&storage).is_err());
        assert_eq!(NormsBlob::read(&storage, "_0", 0, 1, 1).unwrap().bytes, vec![1]);
    }
}
