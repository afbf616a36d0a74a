//! Fault-injecting storage wrapper for test harnesses.
//!
//! [`FaultInjectingStorage`] delegates to another [`Storage`] and fails
//! operations according to an explicit [`FaultPolicy`]: a maximum total size
//! (emulating a full disk), a seeded random I/O fault rate, and a set of file
//! names whose deletion always fails. The policy can be changed while sessions
//! are running, so a test can fill the disk mid-commit and then free it again.

use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TesseraError};
use crate::storage::lock::IndexLock;
use crate::storage::{Storage, StorageInput, StorageOutput};

/// Which faults to inject.
#[derive(Debug, Clone, Default)]
pub struct FaultPolicy {
    /// Writes that would grow the storage beyond this many bytes fail.
    pub max_size: Option<u64>,

    /// Probability in `[0, 1]` that an open, create, write, rename or delete fails.
    pub random_io_fault_rate: f64,

    /// Files whose deletion always fails.
    pub failing_deletes: HashSet<String>,
}

/// Counters of injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub disk_full: u64,
    pub random: u64,
    pub delete: u64,
}

#[derive(Debug)]
struct FaultState {
    policy: FaultPolicy,
    rng: StdRng,
    stats: FaultStats,
}

impl FaultState {
    fn random_fault(&mut self, op: &str, name: &str) -> io::Result<()> {
        let rate = self.policy.random_io_fault_rate;
        if rate > 0.0 && self.rng.random_bool(rate.min(1.0)) {
            self.stats.random += 1;
            debug!("injecting random fault: {op} {name}");
            return Err(io::Error::other(format!("injected fault: {op} {name}")));
        }
        Ok(())
    }
}

/// A [`Storage`] wrapper that injects faults.
#[derive(Debug, Clone)]
pub struct FaultInjectingStorage {
    inner: Arc<dyn Storage>,
    state: Arc<Mutex<FaultState>>,
}

impl FaultInjectingStorage {
    /// Wrap `inner`; random faults are drawn from a generator seeded with `seed`.
    pub fn new(inner: Arc<dyn Storage>, seed: u64) -> Self {
        FaultInjectingStorage {
            inner,
            state: Arc::new(Mutex::new(FaultState {
                policy: FaultPolicy::default(),
                rng: StdRng::seed_from_u64(seed),
                stats: FaultStats::default(),
            })),
        }
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        self.state.lock().policy = policy;
    }

    pub fn set_max_size(&self, max_size: Option<u64>) {
        self.state.lock().policy.max_size = max_size;
    }

    pub fn set_random_io_fault_rate(&self, rate: f64) {
        self.state.lock().policy.random_io_fault_rate = rate;
    }

    pub fn fail_delete(&self, name: &str) {
        self.state
            .lock()
            .policy
            .failing_deletes
            .insert(name.to_string());
    }

    /// Turn every fault off.
    pub fn clear_faults(&self) {
        self.state.lock().policy = FaultPolicy::default();
    }

    pub fn stats(&self) -> FaultStats {
        self.state.lock().stats
    }
}

impl Storage for FaultInjectingStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.state.lock().random_fault("open", name)?;
        Ok(Box::new(FaultInput {
            inner: self.inner.open_input(name)?,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.state.lock().random_fault("create", name)?;
        Ok(Box::new(FaultOutput {
            name: name.to_string(),
            inner: self.inner.create_output(name)?,
            storage: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
            written: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.policy.failing_deletes.contains(name) {
                state.stats.delete += 1;
                return Err(TesseraError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("injected delete failure: {name}"),
                )));
            }
            state.random_fault("delete", name)?;
        }
        self.inner.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.state.lock().random_fault("rename", old_name)?;
        self.inner.rename_file(old_name, new_name)
    }

    fn size_in_bytes(&self) -> Result<u64> {
        self.inner.size_in_bytes()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn make_lock(&self, name: &str) -> Box<dyn IndexLock> {
        self.inner.make_lock(name)
    }

    fn clear_lock(&self, name: &str) -> Result<()> {
        self.inner.clear_lock(name)
    }

    fn location(&self) -> String {
        format!("faulty:{}", self.inner.location())
    }
}

#[derive(Debug)]
struct FaultInput {
    inner: Box<dyn StorageInput>,
}

impl Read for FaultInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for FaultInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl StorageInput for FaultInput {
    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[derive(Debug)]
struct FaultOutput {
    name: String,
    inner: Box<dyn StorageOutput>,
    storage: Arc<dyn Storage>,
    state: Arc<Mutex<FaultState>>,
    written: u64,
}

impl Write for FaultOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock();
            if let Some(max_size) = state.policy.max_size {
                // Unpublished bytes of this output count towards the limit.
                let used = self
                    .storage
                    .size_in_bytes()
                    .map_err(|e| io::Error::other(e.to_string()))?;
                let after = used + self.written + buf.len() as u64;
                if after > max_size {
                    state.stats.disk_full += 1;
                    debug!("injecting disk full writing {}: {after} > {max_size}", self.name);
                    return Err(io::Error::other(format!(
                        "disk full writing {}: need {after} bytes, limit {max_size}",
                        self.name
                    )));
                }
            }
            state.random_fault("write", &self.name)?;
        }

        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StorageOutput for FaultOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.inner.flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
