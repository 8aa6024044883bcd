//! Mutex wrapper used across the stack.
//!
//! The original kernel's mutex disables interrupts around a spinlock
//! because a single core can otherwise deadlock against its own interrupt
//! handler. This stack runs on a hosted OS with real threads instead of
//! interrupt handlers, so the same role is filled by `std::sync::Mutex`:
//! the worker thread and application threads block on contention rather
//! than spin, which is both correct and idiomatic here.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

/// A mutex guarding shared stack state.
///
/// A poisoned lock (a prior holder panicked while holding it) is treated as
/// an unrecoverable worker-invariant violation: the stack has no defined
/// behavior past that point, so the panic propagates rather than silently
/// continuing over possibly-torn state.
pub struct Mutex<T> {
    inner: StdMutex<T>,
}

impl<T> Mutex<T> {
    /// Create a new mutex wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: StdMutex::new(value),
        }
    }

    /// Acquire the lock, blocking the calling thread until it is free.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: self.inner.lock().expect("stack mutex poisoned"),
        }
    }
}

/// Guard returned by [`Mutex::lock`].
pub struct MutexGuard<'a, T> {
    inner: StdMutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
