//!
//! Single-slot Mailbox
//!
//! A blocking hand-off channel holding at most one value. `put` waits while
//! the slot is full and `take` waits while it is empty, so each value placed
//! by one `put` is retrieved by exactly one `take`.
//!
//! Typical use is ping-pong between cooperating threads:
//! ```rust,ignore
//! let token = Mailbox::with_value(0);
//! let n = token.take();
//! token.put(n + 1);
//! ```
//!

use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::poison;

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    /// Signalled when the slot becomes full; `take` waits here.
    filled: Condvar,
    /// Signalled when the slot becomes empty; `put` waits here.
    emptied: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            filled: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// Creates a mailbox that is full from construction.
    pub fn with_value(value: T) -> Self {
        Self {
            slot: Mutex::new(Some(value)),
            filled: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// Stores `value`, blocking while the slot is full.
    pub fn put(&self, value: T) {
        let mut slot = poison::lock(&self.slot);
        while slot.is_some() {
            slot = poison::wait(&self.emptied, slot);
        }
        *slot = Some(value);
        self.filled.notify_one();
    }

    /// Removes and returns the value, blocking while the slot is empty.
    pub fn take(&self) -> T {
        let mut slot = poison::lock(&self.slot);
        loop {
            if let Some(value) = slot.take() {
                self.emptied.notify_one();
                return value;
            }
            slot = poison::wait(&self.filled, slot);
        }
    }

    /// Stores `value` only if the slot is empty. Hands the value back otherwise.
    pub fn try_put(&self, value: T) -> Result<(), T> {
        let mut slot = poison::lock(&self.slot);
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        self.filled.notify_one();
        Ok(())
    }

    pub fn try_take(&self) -> Option<T> {
        let mut slot = poison::lock(&self.slot);
        let value = slot.take();
        if value.is_some() {
            self.emptied.notify_one();
        }
        value
    }

    pub fn is_full(&self) -> bool {
        poison::lock(&self.slot).is_some()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("full", &self.is_full())
            .finish()
    }
}
