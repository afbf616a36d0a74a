//! Command line argument parsing for the Tessera CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// Tessera - inspect and maintain file-based inverted indexes
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera")]
#[command(about = "Inspect and maintain the commits and files of a Tessera index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct TesseraArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Index configuration file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE", env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl TesseraArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the latest commit, its segments and the lock state
    Info(IndexPathArgs),

    /// List every readable commit in the directory
    Commits(IndexPathArgs),

    /// Verify the latest commit and every file it references
    Check(IndexPathArgs),

    /// Add pre-analyzed documents from a JSON Lines file
    Add(AddArgs),

    /// Delete every document containing a term
    Delete(DeleteArgs),

    /// Merge all segments into one
    Optimize(IndexPathArgs),

    /// Remove index files no commit references
    Gc(GcArgs),

    /// Remove a stale write lock
    Unlock(UnlockArgs),
}

/// Arguments for commands that only need the index location
#[derive(Parser, Debug, Clone)]
pub struct IndexPathArgs {
    /// Path to the index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,
}

/// Arguments for adding documents
#[derive(Parser, Debug, Clone)]
pub struct AddArgs {
    /// Path to the index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Document file: one JSON object per line mapping field names to text
    /// or to arrays of terms
    #[arg(value_name = "DOCUMENT_FILE")]
    pub document_file: PathBuf,

    /// Replace the index instead of appending to it
    #[arg(long)]
    pub create: bool,

    /// Flush after this many documents
    #[arg(short, long)]
    pub batch_size: Option<usize>,
}

/// Arguments for deleting documents
#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    /// Path to the index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Field of the term
    #[arg(value_name = "FIELD")]
    pub field: String,

    /// Term text
    #[arg(value_name = "TERM")]
    pub term: String,
}

/// Arguments for garbage collection
#[derive(Parser, Debug, Clone)]
pub struct GcArgs {
    /// Path to the index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// List the files that would be removed without removing them
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for removing the write lock
#[derive(Parser, Debug, Clone)]
pub struct UnlockArgs {
    /// Path to the index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Remove the lock even though a live session may hold it
    #[arg(long)]
    pub force: bool,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}
