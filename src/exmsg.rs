//! The core thread's work queue.
//!
//! The original runs every protocol event — inbound frames, blocking API
//! calls from application threads, and periodic timer ticks — through a
//! single bounded queue so the core thread never touches shared state from
//! more than one call site. [`ExMsgQueue`] is the same idea built the same
//! way `mblock` builds its free list: a mutex-guarded deque paired with two
//! counting semaphores, one for free slots and one for filled ones, so a
//! full queue blocks producers and an empty queue blocks the consumer
//! instead of either side polling.

use crate::pktbuf::PktBuf;
use crate::sync::{Mutex, Semaphore};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;

/// One unit of work handed to the core thread.
pub enum ExMsg {
    /// A frame arrived on a network interface, from `src_ip`, and needs
    /// protocol dispatch.
    RxFrame {
        netif_id: usize,
        src_ip: Ipv4Addr,
        packet: PktBuf,
    },
    /// A blocking socket call needs to run on the core thread, against the
    /// engine it alone owns.
    ApiCall(Box<dyn FnOnce(&mut crate::worker::Engine) + Send>),
    /// The timer wheel's scan period elapsed.
    TimerTick,
}

impl std::fmt::Debug for ExMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExMsg::RxFrame { netif_id, src_ip, packet } => f
                .debug_struct("RxFrame")
                .field("netif_id", netif_id)
                .field("src_ip", src_ip)
                .field("len", &packet.total_size())
                .finish(),
            ExMsg::ApiCall(_) => f.write_str("ApiCall(..)"),
            ExMsg::TimerTick => f.write_str("TimerTick"),
        }
    }
}

/// Bounded FIFO of [`ExMsg`] shared between application threads, network
/// drivers, and the core thread.
pub struct ExMsgQueue {
    queue: Mutex<VecDeque<ExMsg>>,
    free_slots: Semaphore,
    filled_slots: Semaphore,
}

impl ExMsgQueue {
    /// Create a queue that can hold up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            free_slots: Semaphore::new(capacity),
            filled_slots: Semaphore::new(0),
        }
    }

    /// Push a message, blocking the caller if the queue is full.
    pub fn send(&self, msg: ExMsg) {
        self.free_slots.wait();
        self.queue.lock().push_back(msg);
        self.filled_slots.post();
    }

    /// Push a message without blocking; fails if the queue is full.
    pub fn try_send(&self, msg: ExMsg) -> Result<(), ExMsg> {
        if !self.free_slots.try_wait() {
            return Err(msg);
        }
        self.queue.lock().push_back(msg);
        self.filled_slots.post();
        Ok(())
    }

    /// Pop the next message, blocking the calling (core) thread until one
    /// is available.
    pub fn recv(&self) -> ExMsg {
        self.filled_slots.wait();
        let msg = self
            .queue
            .lock()
            .pop_front()
            .expect("filled-slot count desynchronized from queue contents");
        self.free_slots.post();
        msg
    }

    /// Pop the next message, blocking up to `timeout`. Used by the core
    /// thread's main loop to wake periodically even with no traffic, so the
    /// timer wheel keeps advancing.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ExMsg> {
        if !self.filled_slots.wait_timeout(timeout) {
            return None;
        }
        let msg = self
            .queue
            .lock()
            .pop_front()
            .expect("filled-slot count desynchronized from queue contents");
        self.free_slots.post();
        Some(msg)
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let q = ExMsgQueue::new(4);
        q.send(ExMsg::TimerTick);
        q.try_send(ExMsg::ApiCall(Box::new(|_engine| {}))).unwrap();
        assert!(matches!(q.recv(), ExMsg::TimerTick));
        assert!(matches!(q.recv(), ExMsg::ApiCall(_)));
    }

    #[test]
    fn full_queue_rejects_try_send() {
        let q = ExMsgQueue::new(1);
        q.send(ExMsg::TimerTick);
        assert!(q.try_send(ExMsg::TimerTick).is_err());
    }

    #[test]
    fn recv_timeout_reports_empty_queue() {
        let q = ExMsgQueue::new(1);
        assert!(q.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn send_wakes_a_blocked_receiver() {
        let q = Arc::new(ExMsgQueue::new(1));
        let q2 = Arc::clone(&q);
        let received = Arc::new(AtomicBool::new(false));
        let received2 = Arc::clone(&received);
        let handle = thread::spawn(move || {
            q2.recv();
            received2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!received.load(Ordering::SeqCst));
        q.send(ExMsg::TimerTick);
        handle.join().unwrap();
        assert!(received.load(Ordering::SeqCst));
    }
}
