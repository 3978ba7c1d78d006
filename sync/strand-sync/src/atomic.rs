///
/// Atomic Counter
///
/// A lock-free unsigned 32-bit counter. Arithmetic wraps modulo 2^32:
/// incrementing `u32::MAX` yields `0` and decrementing `0` yields `u32::MAX`.
/// Message ids and similar sequence numbers rely on that wrap.
///
/// All operations use SeqCst ordering for safety and simplicity.
///
/// ```rust,ignore
/// let counter = AtomicCounter::new(0);
/// counter.increment();
/// assert!(counter.is_positive());
/// ```
///

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub struct AtomicCounter {
    inner: AtomicU32,
}

impl AtomicCounter {
    pub const fn new(value: u32) -> Self {
        Self {
            inner: AtomicU32::new(value),
        }
    }

    pub fn get(&self) -> u32 {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u32) {
        self.inner.store(value, Ordering::SeqCst)
    }

    /// Prefix increment: returns the new value.
    pub fn increment(&self) -> u32 {
        self.fetch_increment().wrapping_add(1)
    }

    /// Postfix increment: returns the value before the increment.
    pub fn fetch_increment(&self) -> u32 {
        self.inner.fetch_add(1, Ordering::SeqCst)
    }

    /// Prefix decrement: returns the new value.
    pub fn decrement(&self) -> u32 {
        self.fetch_decrement().wrapping_sub(1)
    }

    /// Postfix decrement: returns the value before the decrement.
    pub fn fetch_decrement(&self) -> u32 {
        self.inner.fetch_sub(1, Ordering::SeqCst)
    }

    /// Adds `n` and returns the new value.
    pub fn add(&self, n: u32) -> u32 {
        self.inner.fetch_add(n, Ordering::SeqCst).wrapping_add(n)
    }

    pub fn compare_equals(&self, value: u32) -> bool {
        self.get() == value
    }

    /// Stores `new` if the counter currently holds `expected`.
    /// Returns the previous value either way, as `Ok` on success.
    pub fn compare_exchange(&self, expected: u32, new: u32) -> Result<u32, u32> {
        self.inner
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn is_positive(&self) -> bool {
        self.get() > 0
    }
}

impl From<u32> for AtomicCounter {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl PartialEq<u32> for AtomicCounter {
    fn eq(&self, other: &u32) -> bool {
        self.compare_equals(*other)
    }
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicCounter").field(&self.get()).finish()
    }
}
