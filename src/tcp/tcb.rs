//! TCP control blocks and the connection table.
//!
//! Every live connection, and every listening socket, is a [`Tcb`] held in
//! a [`collections::Slab`]; lookups are a linear scan over live handles
//! with a wildcard fallback for `LISTEN` sockets, matching `tcp_find`'s
//! lookup order in the original (exact 4-tuple match first, then a
//! listening socket bound to the destination port on any remote).

use crate::collections::{Handle, Slab};
use crate::tcp::header::Seq;
use crate::tcp::state::State;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};

/// Opaque reference to a live TCB.
pub type TcbHandle = Handle<Tcb>;

/// Send-side sequence state, `snd` in RFC 793 terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendSeq {
    pub iss: Seq,
    pub una: Seq,
    pub nxt: Seq,
    pub wnd: u16,
}

/// Receive-side sequence state, `rcv` in RFC 793 terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvSeq {
    pub iss: Seq,
    pub nxt: Seq,
    pub wnd: u16,
}

/// Outcome delivered to a blocked application thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Closed,
    Reset,
    Unreachable,
}

/// A `Condvar`-backed descriptor a socket call blocks on until the worker
/// resolves it.
#[derive(Default)]
pub struct Waiter {
    result: Mutex<Option<WaitOutcome>>,
    ready: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until [`Waiter::wake`] is called.
    pub fn block(&self) -> WaitOutcome {
        let mut guard = self.result.lock().expect("waiter mutex poisoned");
        while guard.is_none() {
            guard = self.ready.wait(guard).expect("waiter mutex poisoned");
        }
        guard.take().expect("checked Some above")
    }

    pub fn wake(&self, outcome: WaitOutcome) {
        *self.result.lock().expect("waiter mutex poisoned") = Some(outcome);
        self.ready.notify_all();
    }
}

/// The 4-tuple identifying a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourTuple {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

/// A TCP control block.
pub struct Tcb {
    pub tuple: FourTuple,
    pub state: State,
    pub snd: SendSeq,
    pub rcv: RecvSeq,
    pub syn_out: bool,
    pub fin_out: bool,
    pub irs_valid: bool,
    /// Data queued for transmission but not yet sent, oldest first.
    pub send_buf: Vec<u8>,
    /// Data received and reassembled, not yet read by the application.
    pub recv_buf: Vec<u8>,
    /// Woken when new data or a state change is relevant to a reader.
    pub readers: Vec<Arc<Waiter>>,
    /// Woken when send buffer space frees up or the connection ends.
    pub writers: Vec<Arc<Waiter>>,
    /// Woken when a connect attempt resolves (accepted, reset, or timed out).
    pub connectors: Vec<Arc<Waiter>>,
    /// Scheduled 2·MSL expiry for TIME_WAIT, if armed.
    pub time_wait_timer: Option<crate::timer::TimerHandle>,
    /// Set once a listener's completed child has been handed to an
    /// `accept()` caller, so the same connection isn't accepted twice.
    pub accepted: bool,
}

impl Tcb {
    pub fn new(tuple: FourTuple, state: State) -> Self {
        Self {
            tuple,
            state,
            snd: SendSeq::default(),
            rcv: RecvSeq::default(),
            syn_out: false,
            fin_out: false,
            irs_valid: false,
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            connectors: Vec::new(),
            time_wait_timer: None,
            accepted: false,
        }
    }

    pub fn wake_readers(&mut self, outcome: WaitOutcome) {
        for w in self.readers.drain(..) {
            w.wake(outcome);
        }
    }

    pub fn wake_writers(&mut self, outcome: WaitOutcome) {
        for w in self.writers.drain(..) {
            w.wake(outcome);
        }
    }

    pub fn wake_connectors(&mut self, outcome: WaitOutcome) {
        for w in self.connectors.drain(..) {
            w.wake(outcome);
        }
    }

    pub fn wake_all(&mut self, outcome: WaitOutcome) {
        self.wake_readers(outcome);
        self.wake_writers(outcome);
        self.wake_connectors(outcome);
    }
}

/// All live TCBs, addressed by handle and searchable by 4-tuple.
pub struct TcbTable {
    tcbs: Slab<Tcb>,
}

impl TcbTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tcbs: Slab::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, tcb: Tcb) -> Option<TcbHandle> {
        self.tcbs.insert(tcb)
    }

    pub fn remove(&mut self, handle: TcbHandle) -> Option<Tcb> {
        self.tcbs.remove(handle)
    }

    pub fn get(&self, handle: TcbHandle) -> Option<&Tcb> {
        self.tcbs.get(handle)
    }

    pub fn get_mut(&mut self, handle: TcbHandle) -> Option<&mut Tcb> {
        self.tcbs.get_mut(handle)
    }

    pub fn len(&self) -> usize {
        self.tcbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tcbs.is_empty()
    }

    /// Find the TCB serving `(dest_ip, dest_port, src_ip, src_port)`.
    ///
    /// Tries an exact 4-tuple match first; if none exists, falls back to a
    /// `LISTEN` TCB bound to `dest_port` on `dest_ip` (or the unspecified
    /// address, `0.0.0.0`, for a wildcard bind), mirroring `tcp_find`.
    pub fn find(
        &self,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        src_ip: Ipv4Addr,
        src_port: u16,
    ) -> Option<TcbHandle> {
        if let Some((handle, _)) = self.tcbs.iter().find(|(_, tcb)| {
            tcb.tuple.local_ip == dest_ip
                && tcb.tuple.local_port == dest_port
                && tcb.tuple.remote_ip == src_ip
                && tcb.tuple.remote_port == src_port
        }) {
            return Some(handle);
        }
        self.tcbs
            .iter()
            .find(|(_, tcb)| {
                tcb.state == State::Listen
                    && tcb.tuple.local_port == dest_port
                    && (tcb.tuple.local_ip == dest_ip
                        || tcb.tuple.local_ip == Ipv4Addr::UNSPECIFIED)
            })
            .map(|(handle, _)| handle)
    }

    /// Claim one not-yet-accepted `ESTABLISHED` child of the listener bound
    /// to `listener_port`, marking it accepted so a later call won't return
    /// it again. Used by `accept()`.
    pub fn claim_established_child(&mut self, listener_port: u16) -> Option<TcbHandle> {
        let found = self.tcbs.iter().find(|(_, tcb)| {
            !tcb.accepted && tcb.state == State::Established && tcb.tuple.local_port == listener_port
        }).map(|(handle, _)| handle);
        if let Some(handle) = found {
            if let Some(tcb) = self.tcbs.get_mut(handle) {
                tcb.accepted = true;
            }
        }
        found
    }
}
