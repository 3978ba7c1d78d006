//!
//! strand-sync - Concurrency Primitives
//!
//! The synchronization types every read/write path on shared storage engine
//! state passes through. The five primitives are independent of each other.
//!
//! ## Counters
//!
//! - `AtomicCounter` - lock-free `u32` counter, wraps modulo 2^32
//!
//! ## Hand-off
//!
//! - `Mailbox<T>` - single-slot blocking channel; `put` waits while full,
//!   `take` waits while empty
//!
//! ## Worker Pool
//!
//! - `WorkerPool::new(n)` - start N workers
//! - `pool.schedule(f)` - queue a work item, never blocks
//! - `pool.join()` - wait for all queued work, then stop the workers
//!
//! ## Locks
//!
//! - `NamedRwLock` - reader/writer lock with timed acquisition, scoped
//!   guards, early release and downgrade
//! - `RecursiveEngineLock` - database-scope reader/writer lock, reentrant
//!   per thread, with `at_least_read_locked` / `is_write_locked`
//!   introspection for asserting lock invariants
//!
//! Blocking operations suspend on a condition variable; nothing spins.
//!

mod poison;

pub mod atomic;
pub mod config;
pub mod engine_lock;
pub mod error;
pub mod mailbox;
pub mod pool;
pub mod rwlock;

pub use atomic::*;
pub use config::*;
pub use engine_lock::*;
pub use error::*;
pub use mailbox::*;
pub use pool::*;
pub use rwlock::*;
