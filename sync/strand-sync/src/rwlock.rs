//!
//! Named Reader/Writer Lock
//!
//! Many concurrent readers or one writer, never both. Acquisition can wait
//! indefinitely, wait up to a bound, or try once:
//!
//! - `acquire_read(None)` - wait until granted
//! - `acquire_read(Some(d))` - wait at most `d`, `false` on timeout
//! - `acquire_read(Some(Duration::ZERO))` - try once
//!
//! Each successful `acquire_*` must be paired with exactly one `release`.
//! `read()`, `write()` and the `try_*_for` variants return an `RwLockGuard`
//! that releases on every exit path, can be released early, and can
//! downgrade a write hold to a read hold.
//!
//! The name is for diagnostics only; two locks with the same name are
//! unrelated.
//!
//! ## Fairness
//!
//! `Fairness::ReaderPreferred` (the default) lets a new reader in whenever
//! no writer holds the lock, even if a writer is queued. A queued writer is
//! guaranteed to run only once readers stop arriving. This is what lets a
//! reader pass a writer that is itself waiting behind an earlier reader.
//!
//! `Fairness::WriterPreferred` holds new readers back while any writer is
//! queued; the writer runs as soon as the readers active when it queued
//! have released.
//!

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::RwLockConfig;
use crate::error::SyncError;
use crate::poison;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fairness {
    #[default]
    ReaderPreferred,
    WriterPreferred,
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

impl RwState {
    fn grantable(&self, mode: LockMode, fairness: Fairness) -> bool {
        match mode {
            LockMode::Read => {
                !self.writer
                    && (fairness == Fairness::ReaderPreferred || self.waiting_writers == 0)
            }
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => self.writer = true,
        }
    }
}

pub struct NamedRwLock {
    name: String,
    state: Mutex<RwState>,
    changed: Condvar,
    default_timeout: Option<Duration>,
    fairness: Fairness,
}

impl NamedRwLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RwState::default()),
            changed: Condvar::new(),
            default_timeout: None,
            fairness: Fairness::default(),
        }
    }

    /// A lock whose `guard` calls give up after `timeout`.
    pub fn with_default_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
            ..Self::new(name)
        }
    }

    pub fn from_config(name: impl Into<String>, config: &RwLockConfig) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            fairness: config.fairness,
            ..Self::new(name)
        }
    }

    pub fn with_fairness(mut self, fairness: Fairness) -> Self {
        self.fairness = fairness;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn acquire_read(&self, timeout: Option<Duration>) -> bool {
        self.acquire(LockMode::Read, timeout)
    }

    pub fn acquire_write(&self, timeout: Option<Duration>) -> bool {
        self.acquire(LockMode::Write, timeout)
    }

    /// Waits until `mode` can be granted. `None` waits indefinitely and
    /// `Some(Duration::ZERO)` tries once. Returns `false` on timeout, with
    /// the lock state unchanged.
    pub fn acquire(&self, mode: LockMode, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        // A timeout too large to represent is as good as none.
        let deadline = timeout.and_then(|t| start.checked_add(t));

        let mut state = poison::lock(&self.state);
        if mode == LockMode::Write {
            state.waiting_writers += 1;
        }

        let granted = loop {
            if state.grantable(mode, self.fairness) {
                state.grant(mode);
                break true;
            }
            match deadline {
                None => state = poison::wait(&self.changed, state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    state = poison::wait_timeout(&self.changed, state, deadline - now).0;
                }
            }
        };

        if mode == LockMode::Write {
            state.waiting_writers -= 1;
            if !granted && self.fairness == Fairness::WriterPreferred {
                // Readers held back by this writer may go now.
                self.changed.notify_all();
            }
        }
        drop(state);

        if granted {
            trace!(lock = %self.name, %mode, "acquired");
        } else {
            debug!(lock = %self.name, %mode, waited_ms = start.elapsed().as_millis() as u64, "acquire timed out");
        }
        granted
    }

    /// Releases one acquisition in `mode`.
    ///
    /// # Panics
    ///
    /// Panics if no acquisition in `mode` is outstanding.
    pub fn release(&self, mode: LockMode) {
        let mut state = poison::lock(&self.state);
        match mode {
            LockMode::Read => {
                assert!(
                    state.readers > 0,
                    "release(read) on lock '{}' with no read acquisition outstanding",
                    self.name
                );
                state.readers -= 1;
                if state.readers == 0 {
                    self.changed.notify_all();
                }
            }
            LockMode::Write => {
                assert!(
                    state.writer,
                    "release(write) on lock '{}' which is not write-locked",
                    self.name
                );
                state.writer = false;
                self.changed.notify_all();
            }
        }
        drop(state);
        trace!(lock = %self.name, %mode, "released");
    }

    /// Turns the write acquisition into a read acquisition without letting
    /// another writer in between.
    fn downgrade(&self) {
        let mut state = poison::lock(&self.state);
        assert!(
            state.writer,
            "downgrade on lock '{}' which is not write-locked",
            self.name
        );
        state.writer = false;
        state.readers += 1;
        self.changed.notify_all();
    }

    pub fn read(&self) -> RwLockGuard<'_> {
        self.acquire_read(None);
        RwLockGuard::new(self, LockMode::Read)
    }

    pub fn write(&self) -> RwLockGuard<'_> {
        self.acquire_write(None);
        RwLockGuard::new(self, LockMode::Write)
    }

    pub fn try_read_for(&self, timeout: Duration) -> Option<RwLockGuard<'_>> {
        self.acquire_read(Some(timeout))
            .then(|| RwLockGuard::new(self, LockMode::Read))
    }

    pub fn try_write_for(&self, timeout: Duration) -> Option<RwLockGuard<'_>> {
        self.acquire_write(Some(timeout))
            .then(|| RwLockGuard::new(self, LockMode::Write))
    }

    /// Acquires `mode` using the lock's default timeout.
    pub fn guard(&self, mode: LockMode) -> Result<RwLockGuard<'_>, SyncError> {
        let start = Instant::now();
        if self.acquire(mode, self.default_timeout) {
            Ok(RwLockGuard::new(self, mode))
        } else {
            Err(SyncError::LockTimeout {
                name: self.name.clone(),
                mode,
                waited_ms: start.elapsed().as_millis(),
            })
        }
    }

    /// Number of read acquisitions currently held. A snapshot only.
    pub fn readers(&self) -> usize {
        poison::lock(&self.state).readers
    }

    /// Whether a writer currently holds the lock. A snapshot only.
    pub fn is_write_locked(&self) -> bool {
        poison::lock(&self.state).writer
    }
}

impl fmt::Debug for NamedRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = poison::lock(&self.state);
        f.debug_struct("NamedRwLock")
            .field("name", &self.name)
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("waiting_writers", &state.waiting_writers)
            .field("fairness", &self.fairness)
            .finish()
    }
}

/// Owns one acquisition of a `NamedRwLock` and releases it when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwLockGuard<'a> {
    lock: &'a NamedRwLock,
    mode: LockMode,
    held: bool,
}

impl<'a> RwLockGuard<'a> {
    fn new(lock: &'a NamedRwLock, mode: LockMode) -> Self {
        Self {
            lock,
            mode,
            held: true,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock(&self) -> &'a NamedRwLock {
        self.lock
    }

    /// Releases before the end of the scope. Consuming the guard makes a
    /// second release impossible.
    pub fn release(mut self) {
        self.unlock();
    }

    /// Trades a write hold for a read hold with no writer window in between.
    ///
    /// # Panics
    ///
    /// Panics if the guard holds a read acquisition.
    pub fn downgrade(mut self) -> RwLockGuard<'a> {
        assert_eq!(
            self.mode,
            LockMode::Write,
            "downgrade of a read guard on lock '{}'",
            self.lock.name
        );
        self.lock.downgrade();
        self.mode = LockMode::Read;
        self
    }

    fn unlock(&mut self) {
        if self.held {
            self.held = false;
            self.lock.release(self.mode);
        }
    }
}

impl Drop for RwLockGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}
