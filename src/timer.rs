//! Scheduled callbacks scanned by the protocol worker.
//!
//! The original stack carries a timer list scanned once per
//! `TIMER_SCAN_PERIOD` tick; entries whose deadline has passed fire and are
//! removed. This is that same coarse wheel, built on the slab used
//! elsewhere for handle-indexed storage instead of an intrusive list, since
//! every timer here fires at most once (TIME_WAIT expiry, retransmit
//! backoff) rather than needing a full hierarchical wheel.

use crate::collections::{Handle, Slab};

/// Opaque reference to a scheduled timer.
pub type TimerHandle = Handle<Entry>;

pub struct Entry {
    deadline_ms: u64,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

/// A coarse timer wheel driven by the worker's periodic scan.
pub struct TimerWheel {
    entries: Slab<Entry>,
    now_ms: u64,
}

impl TimerWheel {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            now_ms: 0,
        }
    }

    /// Schedule `callback` to fire `delay_ms` from the wheel's current
    /// clock. Returns `None` if the wheel is full.
    pub fn schedule(
        &mut self,
        delay_ms: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<TimerHandle> {
        self.entries.insert(Entry {
            deadline_ms: self.now_ms + delay_ms,
            callback: Some(Box::new(callback)),
        })
    }

    /// Cancel a previously scheduled timer. No-op if it already fired or
    /// was never valid.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(handle);
    }

    /// Advance the wheel's clock by `elapsed_ms` and fire every entry whose
    /// deadline has passed, in deadline order.
    pub fn advance(&mut self, elapsed_ms: u64) {
        self.now_ms += elapsed_ms;
        let mut due: Vec<TimerHandle> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline_ms <= self.now_ms)
            .map(|(h, _)| h)
            .collect();
        due.sort_by_key(|h| {
            self.entries
                .get(*h)
                .map(|e| e.deadline_ms)
                .unwrap_or(u64::MAX)
        });
        for handle in due {
            if let Some(mut entry) = self.entries.remove(handle) {
                if let Some(cb) = entry.callback.take() {
                    cb();
                }
            }
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_once_deadline_passes() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut wheel = TimerWheel::new(4);
        wheel.schedule(100, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        wheel.advance(50);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.advance(50);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.advance(1000);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut wheel = TimerWheel::new(4);
        let handle = wheel.schedule(100, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        wheel.cancel(handle);
        wheel.advance(200);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fires_in_deadline_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut wheel = TimerWheel::new(4);
        for (id, delay) in [(1, 30), (2, 10), (3, 20)] {
            let order = Arc::clone(&order);
            wheel.schedule(delay, move || order.lock().unwrap().push(id));
        }
        wheel.advance(100);
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }
}
