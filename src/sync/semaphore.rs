//! Counting semaphore.
//!
//! The original stack creates one of these per fixed-block pool (count =
//! free-block count) and a pair per bounded queue (free slots, filled
//! slots). This implementation composes a `Mutex` + `Condvar`, the
//! standard hosted-OS construction, rather than a platform-specific
//! primitive.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with an initial count.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Decrement the count, blocking until it is positive.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Decrement the count, blocking until it is positive or `timeout`
    /// elapses. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return false,
            };
            let (guard, _) = self
                .available
                .wait_timeout(count, remaining)
                .expect("semaphore mutex poisoned");
            count = guard;
        }
    }

    /// Try to decrement the count without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.available.notify_one();
    }
}
