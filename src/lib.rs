//! # Tessera
//!
//! The commit and version lifecycle of a local, file-based inverted index.
//!
//! ## Features
//!
//! - Versioned commits (`segments_N`) published by an atomic rename
//! - A single directory write lock with bounded, backing-off acquisition
//! - Reader sessions that detect staleness before changing anything
//! - Copy-on-write deletion and norms generation files
//! - Reference-counted reclamation of unreferenced files
//! - File, in-memory and fault-injecting storage backends

pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;

pub mod prelude {
    pub use crate::config::{IndexConfig, LockConfig, OpenMode};
    pub use crate::document::{Document, Term};
    pub use crate::error::{Result, TesseraError};
    pub use crate::index::{Index, IndexReader, IndexWriter, ReaderState};
    pub use crate::storage::Storage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
