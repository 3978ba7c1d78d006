//!
//! Recursive Engine Lock
//!
//! The database-scope reader/writer lock. Across threads it is an ordinary
//! multi-reader/single-writer lock; within a thread it is reentrant:
//!
//! - `lock_shared` nests freely, and a thread holding the exclusive lock may
//!   also take shared locks without blocking on itself
//! - `lock` nests for a thread that already holds it exclusively
//! - `lock` while holding only a shared lock is a usage error (no upgrades)
//!
//! Per-thread depth lives in thread-local storage keyed by lock instance, so
//! the nested fast path never touches shared state. Only the 0 -> 1 and
//! 1 -> 0 transitions take the internal mutex.
//!
//! ## Global vs logical hold
//!
//! A thread's logical depth and its global hold are tracked separately.
//! `release_early` drops the global exclusive hold while the thread still
//! counts as write-locked; the matching `unlock` then has nothing global to
//! release. Exclusivity is not guaranteed again until `reacquire`. This is
//! an escape hatch for long operations that can tolerate interleaving, not
//! something to reach for by default.
//!
//! ## Thread lifecycle
//!
//! A thread must not end while holding the lock. Thread teardown code calls
//! `release_thread_state` to discard this thread's entry (and get an error
//! back if it leaked a hold); `check_released` lets a supervisor verify at
//! shutdown that no holder remains.
//!

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::poison;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This thread's depths, keyed by lock id. Entries at depth zero are removed.
    static THREAD_DEPTHS: RefCell<HashMap<u64, ThreadDepth>> = RefCell::new(HashMap::new());
}

/// What this thread holds at the global (cross-thread) level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum GlobalHold {
    #[default]
    None,
    Shared,
    Exclusive,
    /// Logically write-locked, global exclusivity given up by `release_early`.
    ReleasedEarly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ThreadDepth {
    read: u32,
    write: u32,
    hold: GlobalHold,
}

impl ThreadDepth {
    fn is_unlocked(&self) -> bool {
        self.read == 0 && self.write == 0
    }
}

/// The calling thread's view of a `RecursiveEngineLock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLockState {
    Unlocked,
    ReadHeld { depth: u32 },
    /// Write-held threads count as read-locked too; `read_depth` is the
    /// number of shared locks nested inside the exclusive one.
    WriteHeld { depth: u32, read_depth: u32 },
}

#[derive(Debug, Default)]
struct GlobalState {
    writer: Option<ThreadId>,
    readers: HashSet<ThreadId>,
    waiting_writers: usize,
}

pub struct RecursiveEngineLock {
    id: u64,
    name: String,
    state: Mutex<GlobalState>,
    /// Readers wait here for the writer to leave.
    readers_cv: Condvar,
    /// Writers wait here for the lock to become free.
    writers_cv: Condvar,
}

impl RecursiveEngineLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(GlobalState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
        }
    }

    /// The process-wide engine lock. Code that can take the lock by
    /// reference should prefer that, so tests can use isolated instances.
    pub fn global() -> &'static RecursiveEngineLock {
        static ENGINE_LOCK: OnceLock<RecursiveEngineLock> = OnceLock::new();
        ENGINE_LOCK.get_or_init(|| RecursiveEngineLock::new("engine"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_shared(&self) {
        self.lock_shared_within(None);
    }

    /// Like `lock_shared`, but gives up after `timeout`. A zero timeout
    /// tries once. On failure the thread's state is unchanged.
    pub fn lock_shared_try(&self, timeout: Duration) -> bool {
        self.lock_shared_within(Some(timeout))
    }

    fn lock_shared_within(&self, timeout: Option<Duration>) -> bool {
        let mut depth = self.depth();
        if depth.is_unlocked() {
            if !self.acquire_global(false, timeout) {
                return false;
            }
            depth.hold = GlobalHold::Shared;
        }
        depth.read += 1;
        self.set_depth(depth);
        true
    }

    /// # Panics
    ///
    /// Panics if the calling thread holds no shared lock.
    pub fn unlock_shared(&self) {
        let mut depth = self.depth();
        assert!(
            depth.read > 0,
            "unlock_shared on '{}' by a thread holding no shared lock",
            self.name
        );
        depth.read -= 1;
        if depth.is_unlocked() {
            self.release_global(depth.hold);
            depth.hold = GlobalHold::None;
        }
        self.set_depth(depth);
    }

    /// # Panics
    ///
    /// Panics if the calling thread holds only a shared lock.
    pub fn lock(&self) {
        self.lock_within(None);
    }

    /// Like `lock`, but gives up after `timeout`. A zero timeout tries
    /// once. On failure the thread's state is unchanged.
    pub fn lock_try(&self, timeout: Duration) -> bool {
        self.lock_within(Some(timeout))
    }

    fn lock_within(&self, timeout: Option<Duration>) -> bool {
        let mut depth = self.depth();
        if depth.write == 0 {
            assert!(
                depth.read == 0,
                "exclusive lock on '{}' requested while holding only a shared lock; upgrades are not supported",
                self.name
            );
            if !self.acquire_global(true, timeout) {
                return false;
            }
            depth.hold = GlobalHold::Exclusive;
        }
        depth.write += 1;
        self.set_depth(depth);
        true
    }

    /// Leaving the outermost exclusive level releases global exclusivity,
    /// or keeps a shared hold if shared locks taken inside are still open.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock exclusively.
    pub fn unlock(&self) {
        let mut depth = self.depth();
        assert!(
            depth.write > 0,
            "unlock on '{}' by a thread not holding the exclusive lock",
            self.name
        );
        depth.write -= 1;
        if depth.write == 0 {
            depth.hold = match (depth.hold, depth.read > 0) {
                (GlobalHold::Exclusive, false) => {
                    self.release_global(GlobalHold::Exclusive);
                    GlobalHold::None
                }
                (GlobalHold::Exclusive, true) => {
                    self.downgrade_global();
                    GlobalHold::Shared
                }
                (GlobalHold::ReleasedEarly, false) => GlobalHold::None,
                (GlobalHold::ReleasedEarly, true) => {
                    self.acquire_global(false, None);
                    GlobalHold::Shared
                }
                (hold, _) => unreachable!("write-locked thread with global hold {:?}", hold),
            };
        }
        self.set_depth(depth);
    }

    /// Gives up global exclusivity while the thread stays logically
    /// write-locked. Other threads may take the lock until `reacquire`.
    ///
    /// # Panics
    ///
    /// Panics unless the calling thread holds the global exclusive lock.
    pub fn release_early(&self) {
        let mut depth = self.depth();
        assert!(
            depth.write > 0 && depth.hold == GlobalHold::Exclusive,
            "release_early on '{}' requires holding the exclusive lock",
            self.name
        );
        self.release_global(GlobalHold::Exclusive);
        depth.hold = GlobalHold::ReleasedEarly;
        self.set_depth(depth);
        trace!(lock = %self.name, "released early");
    }

    /// Restores the global exclusive hold given up by `release_early`.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has not released early.
    pub fn reacquire(&self) {
        let mut depth = self.depth();
        assert!(
            depth.hold == GlobalHold::ReleasedEarly,
            "reacquire on '{}' without a preceding release_early",
            self.name
        );
        self.acquire_global(true, None);
        depth.hold = GlobalHold::Exclusive;
        self.set_depth(depth);
        trace!(lock = %self.name, "reacquired after early release");
    }

    pub fn at_least_read_locked(&self) -> bool {
        !self.depth().is_unlocked()
    }

    pub fn is_write_locked(&self) -> bool {
        self.depth().write > 0
    }

    pub fn thread_state(&self) -> ThreadLockState {
        let depth = self.depth();
        if depth.write > 0 {
            ThreadLockState::WriteHeld {
                depth: depth.write,
                read_depth: depth.read,
            }
        } else if depth.read > 0 {
            ThreadLockState::ReadHeld { depth: depth.read }
        } else {
            ThreadLockState::Unlocked
        }
    }

    pub fn read_guard(&self) -> EngineReadGuard<'_> {
        self.lock_shared();
        EngineReadGuard::new(self)
    }

    pub fn try_read_guard(&self, timeout: Duration) -> Option<EngineReadGuard<'_>> {
        self.lock_shared_try(timeout).then(|| EngineReadGuard::new(self))
    }

    pub fn write_guard(&self) -> EngineWriteGuard<'_> {
        self.lock();
        EngineWriteGuard::new(self)
    }

    pub fn try_write_guard(&self, timeout: Duration) -> Option<EngineWriteGuard<'_>> {
        self.lock_try(timeout).then(|| EngineWriteGuard::new(self))
    }

    /// Thread teardown hook: forgets the calling thread's state for this
    /// lock. A thread still holding the lock has its global hold released
    /// and gets `SyncError::LeakedLock` back.
    pub fn release_thread_state(&self) -> Result<(), SyncError> {
        let depth = THREAD_DEPTHS
            .with_borrow_mut(|depths| depths.remove(&self.id))
            .unwrap_or_default();
        if depth.is_unlocked() {
            return Ok(());
        }

        self.release_global(depth.hold);
        let thread = current_thread_label();
        warn!(
            lock = %self.name,
            thread = %thread,
            read_depth = depth.read,
            write_depth = depth.write,
            "thread state discarded while holding lock"
        );
        Err(SyncError::LeakedLock {
            lock: self.name.clone(),
            thread,
            read_depth: depth.read,
            write_depth: depth.write,
        })
    }

    /// Shutdown check: fails if any thread still holds the lock globally.
    pub fn check_released(&self) -> Result<(), SyncError> {
        let state = poison::lock(&self.state);
        if state.writer.is_none() && state.readers.is_empty() {
            return Ok(());
        }
        Err(SyncError::LockStillHeld {
            lock: self.name.clone(),
            readers: state.readers.len(),
            writer: state.writer.map(|id| format!("{:?}", id)),
        })
    }

    fn depth(&self) -> ThreadDepth {
        THREAD_DEPTHS.with_borrow(|depths| depths.get(&self.id).copied().unwrap_or_default())
    }

    fn set_depth(&self, depth: ThreadDepth) {
        THREAD_DEPTHS.with_borrow_mut(|depths| {
            if depth.is_unlocked() {
                depths.remove(&self.id);
            } else {
                depths.insert(self.id, depth);
            }
        });
    }

    /// Blocks until the global lock is grantable in the requested mode, or
    /// until `timeout` elapses. Readers only wait for an active writer.
    fn acquire_global(&self, exclusive: bool, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let start = Instant::now();
        let deadline = timeout.and_then(|t| start.checked_add(t));

        let mut state = poison::lock(&self.state);
        if exclusive {
            state.waiting_writers += 1;
        }

        let granted = loop {
            let free = state.writer.is_none() && (!exclusive || state.readers.is_empty());
            if free {
                if exclusive {
                    state.writer = Some(me);
                } else {
                    state.readers.insert(me);
                }
                break true;
            }

            let cv = if exclusive { &self.writers_cv } else { &self.readers_cv };
            match deadline {
                None => state = poison::wait(cv, state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    state = poison::wait_timeout(cv, state, deadline - now).0;
                }
            }
        };

        if exclusive {
            state.waiting_writers -= 1;
        }
        drop(state);

        if !granted {
            debug!(
                lock = %self.name,
                exclusive,
                waited_ms = start.elapsed().as_millis() as u64,
                "acquire timed out"
            );
        }
        granted
    }

    fn release_global(&self, hold: GlobalHold) {
        let me = thread::current().id();
        let mut state = poison::lock(&self.state);
        match hold {
            GlobalHold::Shared => {
                let removed = state.readers.remove(&me);
                debug_assert!(removed, "shared release without a global shared hold");
                if state.readers.is_empty() && state.waiting_writers > 0 {
                    self.writers_cv.notify_one();
                }
            }
            GlobalHold::Exclusive => {
                debug_assert_eq!(state.writer, Some(me));
                state.writer = None;
                self.readers_cv.notify_all();
                if state.waiting_writers > 0 {
                    self.writers_cv.notify_one();
                }
            }
            GlobalHold::None | GlobalHold::ReleasedEarly => {}
        }
    }

    /// Exclusive -> shared with no window for another writer.
    fn downgrade_global(&self) {
        let me = thread::current().id();
        let mut state = poison::lock(&self.state);
        debug_assert_eq!(state.writer, Some(me));
        state.writer = None;
        state.readers.insert(me);
        self.readers_cv.notify_all();
    }
}

impl fmt::Debug for RecursiveEngineLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = poison::lock(&self.state);
        f.debug_struct("RecursiveEngineLock")
            .field("name", &self.name)
            .field("writer", &state.writer)
            .field("readers", &state.readers.len())
            .field("waiting_writers", &state.waiting_writers)
            .finish()
    }
}

fn current_thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

/// A shared hold on a `RecursiveEngineLock`, released on drop. Bound to the
/// thread that took it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct EngineReadGuard<'a> {
    lock: &'a RecursiveEngineLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> EngineReadGuard<'a> {
    fn new(lock: &'a RecursiveEngineLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for EngineReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// An exclusive hold on a `RecursiveEngineLock`, released on drop. Bound to
/// the thread that took it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct EngineWriteGuard<'a> {
    lock: &'a RecursiveEngineLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> EngineWriteGuard<'a> {
    fn new(lock: &'a RecursiveEngineLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// See `RecursiveEngineLock::release_early`.
    pub fn release_early(&self) {
        self.lock.release_early();
    }

    pub fn reacquire(&self) {
        self.lock.reacquire();
    }
}

impl Drop for EngineWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
