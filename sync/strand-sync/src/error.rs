///
/// Synchronization error types.
///
/// Recoverable failures only: pool misuse, timed acquisitions that ran out
/// of time, locks left held when a thread or the process winds down, and
/// config loading. Programming errors such as unlocking a lock the calling
/// thread does not hold are panics, not values of this type.
///

use std::path::PathBuf;
use thiserror::Error;

use crate::rwlock::LockMode;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Worker pool needs at least one worker, got {count}")]
    InvalidWorkerCount { count: usize },

    #[error("Worker pool has been joined and no longer accepts work")]
    PoolStopped,

    #[error("Timed out after {waited_ms}ms acquiring {mode} lock on '{name}'")]
    LockTimeout {
        name: String,
        mode: LockMode,
        waited_ms: u128,
    },

    #[error("Thread {thread} still holds '{lock}' (read depth {read_depth}, write depth {write_depth})")]
    LeakedLock {
        lock: String,
        thread: String,
        read_depth: u32,
        write_depth: u32,
    },

    #[error("Lock '{lock}' still held: {readers} reader(s), writer {}", format_writer(writer))]
    LockStillHeld {
        lock: String,
        readers: usize,
        writer: Option<String>,
    },

    #[error("Failed to parse config at {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn format_writer(writer: &Option<String>) -> &str {
    writer.as_deref().unwrap_or("none")
}
