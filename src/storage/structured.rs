//! Checksummed binary file I/O.
//!
//! Every file Tessera writes (commits, segment payloads, deletion bitmaps and
//! norms blobs) is a sequence of little-endian fields followed by a CRC32 of
//! all preceding bytes. [`StructWriter`] accumulates the checksum while writing
//! and appends it on [`StructWriter::close`]; [`StructReader::finish`] checks it
//! and rejects trailing garbage. Truncation and mismatches surface as
//! [`TesseraError::CorruptIndex`].

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use log::warn;

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Size of the trailing checksum.
pub const CHECKSUM_LEN: u64 = 4;

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
    scratch: Vec<u8>,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
            scratch: Vec::with_capacity(10),
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Write a variable-length integer (7 bits per byte, high bit continues).
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let mut encoded = std::mem::take(&mut self.scratch);
        encoded.clear();
        encode_varint(value, &mut encoded);
        let result = self.write_raw(&encoded);
        self.scratch = encoded;
        result
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a sorted integer array using delta encoding.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            let delta = value.wrapping_sub(previous);
            self.write_varint(delta as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Write a string-to-string map in key order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append the checksum, sync and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    file_size: u64,
    name: String,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader. `name` is used in error messages.
    pub fn new(reader: R, name: &str) -> Result<Self> {
        let file_size = reader.size()?;
        if file_size < CHECKSUM_LEN {
            return Err(TesseraError::corrupt(format!(
                "{name}: file too short for checksum ({file_size} bytes)"
            )));
        }
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
            name: name.to_string(),
        })
    }

    /// Bytes left before the checksum.
    pub fn remaining(&self) -> u64 {
        self.file_size
            .saturating_sub(CHECKSUM_LEN)
            .saturating_sub(self.position)
    }

    fn truncated(&self) -> TesseraError {
        TesseraError::corrupt(format!(
            "{}: truncated at byte {} of {}",
            self.name, self.position, self.file_size
        ))
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > self.remaining() {
            return Err(self.truncated());
        }
        match self.reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(self.truncated()),
            Err(e) => return Err(e.into()),
        }
        self.hasher.update(buf);
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.invalid(format!("invalid boolean byte {other}"))),
        }
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte & 0x7F > 1) {
                return Err(self.invalid("varint overflow"));
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a varint that must fit in `u32`.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| self.invalid(format!("value {value} exceeds u32")))
    }

    /// Read a length prefix, rejecting lengths longer than the rest of the file.
    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_varint()?;
        if len > self.remaining() {
            return Err(self.invalid(format!("length {len} exceeds remaining bytes")));
        }
        Ok(len as usize)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| self.invalid(format!("invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_len()?;
        self.read_raw(length)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.fill(&mut bytes)?;
        Ok(bytes)
    }

    /// Read a delta-compressed integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        // Every entry takes at least one byte.
        let length = self.read_len()?;
        let mut values = Vec::with_capacity(length);
        let mut previous = 0u32;

        for _ in 0..length {
            let delta = self.read_varint_u32()?;
            let value = previous.wrapping_add(delta);
            values.push(value);
            previous = value;
        }

        Ok(values)
    }

    /// Read a string-to-string map.
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let length = self.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..length {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// A corruption error naming this file.
    pub fn invalid<S: Into<String>>(&self, msg: S) -> TesseraError {
        TesseraError::corrupt(format!("{}: {}", self.name, msg.into()))
    }

    /// Check that every payload byte was consumed and the checksum matches,
    /// then close the input.
    pub fn finish(mut self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(self.invalid(format!("{} unread bytes before checksum", self.remaining())));
        }

        let stored = match self.reader.read_u32::<LittleEndian>() {
            Ok(value) => value,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(self.truncated()),
            Err(e) => return Err(e.into()),
        };
        let actual = self.hasher.clone().finalize();
        if stored != actual {
            return Err(self.invalid(format!(
                "checksum mismatch (stored {stored:#010x}, computed {actual:#010x})"
            )));
        }
        self.reader.close()
    }
}

/// Write a checksummed file `name` whose body is produced by `body`.
///
/// On failure the partial file is deleted best-effort and the original error
/// is returned.
pub fn write_file<F>(storage: &dyn Storage, name: &str, body: F) -> Result<()>
where
    F: FnOnce(&mut StructWriter<Box<dyn StorageOutput>>) -> Result<()>,
{
    let result = storage.create_output(name).and_then(|output| {
        let mut writer = StructWriter::new(output);
        body(&mut writer)?;
        writer.close()
    });

    if let Err(e) = result {
        if let Err(cleanup) = storage.delete_file(name) {
            warn!("failed to remove partial file {name}: {cleanup}");
        }
        return Err(e);
    }
    Ok(())
}

/// Open `name` for structured reading.
pub fn open_file(storage: &dyn Storage, name: &str) -> Result<StructReader<Box<dyn StorageInput>>> {
    let input = storage.open_input(name)?;
    StructReader::new(input, name)
}
