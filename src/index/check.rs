//! Consistency checks of the latest commit.

use serde::Serialize;

use crate::error::{Result, TesseraError};
use crate::index::commit::CommitDescriptor;
use crate::index::deleter::{FileDeleter, FileRefs};
use crate::index::deletes::DeletionBitmap;
use crate::index::norms::NormsBlob;
use crate::index::segment::{SegmentData, SegmentDescriptor};
use crate::storage::Storage;

/// Result of checking one segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentCheck {
    pub name: String,
    pub doc_count: u32,
    pub del_count: u32,
    pub files: Vec<String>,
    /// First problem found, if any.
    pub error: Option<String>,
}

/// Result of checking the latest commit.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub generation: u64,
    pub version: u64,
    pub segments: Vec<SegmentCheck>,
    /// Files the commit references that do not exist.
    pub missing_files: Vec<String>,
    /// Index files no commit references; a deleter pass would remove them.
    pub unreferenced_files: Vec<String>,
}

impl CheckReport {
    /// Whether every referenced file exists and reads back intact.
    pub fn is_ok(&self) -> bool {
        self.missing_files.is_empty() && self.segments.iter().all(|s| s.error.is_none())
    }
}

fn check_segment(storage: &dyn Storage, descriptor: &SegmentDescriptor) -> Result<()> {
    let data = SegmentData::read(storage, descriptor)?;
    let deletions = DeletionBitmap::for_segment(storage, descriptor)?;
    if deletions.count() != descriptor.del_count {
        return Err(TesseraError::corrupt(format!(
            "{} deletions on disk, commit says {}",
            deletions.count(),
            descriptor.del_count
        )));
    }
    for field_number in NormsBlob::read_overrides(storage, descriptor)?.keys() {
        if data.base_norms(*field_number).is_none() {
            return Err(TesseraError::corrupt(format!(
                "norms override for unknown field {field_number}"
            )));
        }
    }
    Ok(())
}

/// Read the latest commit and every file it references.
///
/// Fails only if no commit can be read; problems with referenced files are
/// collected in the report.
pub fn check_index(storage: &dyn Storage) -> Result<CheckReport> {
    let commit = CommitDescriptor::read(storage)?;

    let missing_files = commit
        .files(true)
        .into_iter()
        .filter(|name| !storage.file_exists(name))
        .collect();

    let segments = commit
        .segments
        .iter()
        .map(|descriptor| SegmentCheck {
            name: descriptor.name.clone(),
            doc_count: descriptor.doc_count,
            del_count: descriptor.del_count,
            files: descriptor.files(),
            error: check_segment(storage, descriptor).err().map(|e| e.to_string()),
        })
        .collect();

    let refs = FileRefs::new();
    let (unreferenced_files, _) = FileDeleter::new(storage, &refs).plan(&commit)?;

    Ok(CheckReport {
        generation: commit.generation,
        version: commit.version,
        segments,
        missing_files,
        unreferenced_files,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::IndexConfig;
    use crate::document::Document;
    use crate::index::writer::IndexWriter;
    use crate::storage::memory::MemoryStorage;

    fn build(storage: &Arc<MemoryStorage>) {
        let mut writer =
            IndexWriter::open(storage.clone(), FileRefs::new(), IndexConfig::default()).unwrap();
        writer
            .add_document(Document::builder().add_text("body", "a b").build())
            .unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_clean_index() {
        let storage = Arc::new(MemoryStorage::new_default());
        build(&storage);

        let report = check_index(storage.as_ref()).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.generation, 2);
        assert_eq!(report.segments.len(), 1);
        assert!(report.unreferenced_files.is_empty());
    }

    #[test]
    fn test_detects_damage() {
        let storage = Arc::new(MemoryStorage::new_default());
        build(&storage);

        storage.corrupt_file("_0.seg", 12).unwrap();
        storage.delete_file("_0.nrm").unwrap();
        let mut output = storage.create_output("_7.seg").unwrap();
        output.close().unwrap();

        let report = check_index(storage.as_ref()).unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.missing_files, vec!["_0.nrm"]);
        assert!(report.segments[0].error.is_some());
        assert_eq!(report.unreferenced_files, vec!["_7.seg"]);
    }
}
