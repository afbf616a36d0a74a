//! Index configuration.
//!
//! [`IndexConfig`] is plain serde data so it can live next to an index as a
//! JSON file. Missing keys fall back to their defaults.
//!
//! ```
//! use tessera::config::{IndexConfig, OpenMode};
//!
//! let config: IndexConfig =
//!     serde_json::from_str(r#"{ "merge_factor": 4, "lock": { "timeout_ms": 50 } }"#).unwrap();
//! assert_eq!(config.merge_factor, 4);
//! assert_eq!(config.lock.timeout_ms, 50);
//! assert_eq!(config.lock.poll_interval_ms, 10);
//! assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
//! config.validate().unwrap();
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::storage::lock::LockRetryPolicy;

/// How a writer treats an existing index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start from an empty commit, discarding existing segments on first commit.
    Create,
    /// Require an existing index.
    Append,
    /// Append if an index exists, create one otherwise.
    #[default]
    CreateOrAppend,
}

/// Directory write lock acquisition settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Total time budget for obtaining the lock.
    pub timeout_ms: u64,

    /// First sleep between attempts; doubles up to `max_poll_interval_ms`.
    pub poll_interval_ms: u64,

    pub max_poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            timeout_ms: 1000,
            poll_interval_ms: 10,
            max_poll_interval_ms: 250,
        }
    }
}

impl LockConfig {
    pub fn retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy::new(
            Duration::from_millis(self.timeout_ms),
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.max_poll_interval_ms),
        )
    }
}

/// Configuration shared by writers and readers of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub lock: LockConfig,

    /// Buffered documents that trigger an automatic flush to a new segment.
    pub max_buffered_docs: usize,

    /// Segment count above which the newest `merge_factor` segments are merged.
    pub merge_factor: usize,

    /// Write new segments as a single compound file.
    pub use_compound_file: bool,

    pub open_mode: OpenMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            lock: LockConfig::default(),
            max_buffered_docs: 1000,
            merge_factor: 10,
            use_compound_file: false,
            open_mode: OpenMode::CreateOrAppend,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_docs == 0 {
            return Err(TesseraError::invalid_config("max_buffered_docs must be at least 1"));
        }
        if self.merge_factor < 2 {
            return Err(TesseraError::invalid_config("merge_factor must be at least 2"));
        }
        if self.lock.max_poll_interval_ms < self.lock.poll_interval_ms {
            return Err(TesseraError::invalid_config(
                "lock.max_poll_interval_ms must not be below lock.poll_interval_ms",
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: IndexConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Same configuration with a different open mode.
    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }
}
