//! Index lifecycle: commits, sessions, generation files and the deleter.
//!
//! This module provides index creation, reading, writing and file management.

pub mod check;
pub mod commit;
pub mod deleter;
pub mod deletes;
pub mod file_names;
#[allow(clippy::module_inception)]
pub mod index;
pub mod norms;
pub mod reader;
pub mod segment;
pub mod writer;

// Re-export commonly used types
pub use check::CheckReport;
pub use commit::CommitDescriptor;
pub use deleter::{DeleterReport, FileDeleter, FileRefs};
pub use deletes::DeletionBitmap;
pub use index::{Index, IndexStats};
pub use norms::NormsBlob;
pub use reader::{IndexReader, ReaderState};
pub use segment::{SegmentData, SegmentDescriptor};
pub use writer::IndexWriter;
