//! Directory-scoped mutual exclusion.
//!
//! A single named lock (`write.lock`) serializes every write-role actor on an
//! index directory: a writer holds it for its whole lifetime, a reader holds it
//! from its first staged mutation until its commit. Acquisition is bounded by
//! a [`LockRetryPolicy`]; running out of time surfaces as
//! [`TesseraError::LockObtainFailed`], never an indefinite wait.

use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Result, TesseraError};

/// Name of the directory write lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Bounded retry with exponential backoff for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Total time budget for obtaining the lock.
    pub timeout: Duration,
    /// First sleep between attempts.
    pub poll_interval: Duration,
    /// Upper bound for the doubled sleep.
    pub max_poll_interval: Duration,
}

impl LockRetryPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration, max_poll_interval: Duration) -> Self {
        LockRetryPolicy {
            timeout,
            poll_interval,
            max_poll_interval: max_poll_interval.max(poll_interval),
        }
    }

    /// A single attempt, no waiting.
    pub fn no_wait() -> Self {
        LockRetryPolicy::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Sleep durations between consecutive attempts, capped so their sum never
    /// exceeds the timeout.
    pub fn backoff(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut remaining = self.timeout;
        let mut delay = self.poll_interval.max(Duration::from_millis(1));
        while !remaining.is_zero() {
            let step = delay.min(remaining);
            delays.push(step);
            remaining -= step;
            delay = (delay * 2).min(self.max_poll_interval.max(Duration::from_millis(1)));
        }
        delays
    }
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        LockRetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_millis(10),
            Duration::from_millis(250),
        )
    }
}

/// A handle on a named directory lock.
pub trait IndexLock: Send + std::fmt::Debug {
    /// Full identity of the lock (storage location and lock name).
    fn name(&self) -> &str;

    /// Try once to obtain the lock. Returns `false` if someone else holds it.
    fn try_obtain(&mut self) -> Result<bool>;

    /// Release the lock if this handle holds it.
    fn release(&mut self) -> Result<()>;

    /// Whether anyone currently holds the lock.
    fn is_locked(&self) -> Result<bool>;

    /// Whether this handle holds the lock.
    fn is_held(&self) -> bool;

    /// Obtain the lock, retrying according to `policy`.
    fn obtain(&mut self, policy: &LockRetryPolicy) -> Result<()> {
        if self.try_obtain()? {
            return Ok(());
        }

        let started = Instant::now();
        for delay in policy.backoff() {
            thread::sleep(delay);
            if self.try_obtain()? {
                debug!("obtained {} after {:?}", self.name(), started.elapsed());
                return Ok(());
            }
        }

        Err(TesseraError::LockObtainFailed {
            lock: self.name().to_string(),
            timeout: policy.timeout,
        })
    }
}
