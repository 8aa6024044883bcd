//! The protocol worker: the single thread that owns the connection table
//! and the TCP state machine.
//!
//! Grounded on the original's core thread design (`exmsg_start` spins up
//! the one thread every protocol event funnels through) generalized from
//! "read one message, dispatch it" into the explicit loop described in the
//! design notes: drain `exmsg`, run RX frames through `tcp::input`, run API
//! calls inline, and scan the timer wheel on every tick so TIME_WAIT
//! entries expire without needing their own thread.

use crate::config::NetConfig;
use crate::exmsg::{ExMsg, ExMsgQueue};
use crate::pktbuf::BlockPool;
use crate::platform::{Ipv4Out, NetDriver};
use crate::error::{NetError, NetResult};
use crate::tcp::input;
use crate::tcp::output;
use crate::tcp::tcb::{TcbHandle, TcbTable};
use crate::timer::TimerWheel;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, trace};

/// Everything the worker needs to process one message: the connection
/// table, the timer wheel, the block pool segments are framed from, the IP
/// handoff, and the TIME_WAIT expiry queue timers feed into.
///
/// Timer callbacks can't borrow `table` directly (they must be `'static`),
/// so an expired TIME_WAIT timer instead pushes its handle onto `expired`;
/// the worker drains that queue right after advancing the wheel.
pub struct Engine {
    pub table: TcbTable,
    pub timers: TimerWheel,
    pub pool: Arc<BlockPool>,
    pub ip: Box<dyn Ipv4Out>,
    pub expired: Arc<Mutex<Vec<TcbHandle>>>,
    pub msl_ms: u64,
    pub local_ip: Ipv4Addr,
    /// Next initial send sequence number handed to a freshly spawned
    /// `SYN_RCVD` child. Advances by a fixed step per connection in place
    /// of the clock-driven generator the original used (not among the
    /// files that survived distillation).
    pub next_iss: u32,
    /// Advertised receive window for connections spawned out of `LISTEN`.
    pub recv_wnd: u16,
}

impl Engine {
    pub fn new(config: &NetConfig, ip: Box<dyn Ipv4Out>, local_ip: Ipv4Addr) -> Self {
        Self {
            table: TcbTable::with_capacity(config.tcp_tcb_cnt),
            timers: TimerWheel::new(config.tcp_tcb_cnt),
            pool: BlockPool::from_config(config),
            ip,
            expired: Arc::new(Mutex::new(Vec::new())),
            msl_ms: config.tcp_msl_ms,
            local_ip,
            next_iss: 1,
            recv_wnd: config.tcp_recv_wnd,
        }
    }

    /// Arm the 2·MSL expiry timer for a TCB that just entered TIME_WAIT.
    pub fn arm_time_wait(&mut self, handle: TcbHandle) {
        if let Some(tcb) = self.table.get_mut(handle) {
            if let Some(old) = tcb.time_wait_timer.take() {
                self.timers.cancel(old);
            }
        }
        let expired = Arc::clone(&self.expired);
        let timer = self
            .timers
            .schedule(2 * self.msl_ms, move || {
                expired.lock().expect("expiry queue poisoned").push(handle);
            });
        if let Some(tcb) = self.table.get_mut(handle) {
            tcb.time_wait_timer = timer;
        }
    }

    /// Queue `tcb`'s initial SYN. Used both by the `LISTEN` handler's
    /// spawned child and by an active open from [`crate::socket`].
    pub fn send_syn(&mut self, handle: TcbHandle) -> NetResult<()> {
        let pool = Arc::clone(&self.pool);
        let tcb = self.table.get_mut(handle).ok_or(NetError::Unreach)?;
        output::send_syn(&pool, &*self.ip, tcb)
    }

    /// Queue `tcb`'s FIN, draining whatever is left in its send buffer
    /// first (see [`output::transmit`]'s FIN-withholding behavior).
    pub fn send_fin(&mut self, handle: TcbHandle) -> NetResult<()> {
        let pool = Arc::clone(&self.pool);
        let tcb = self.table.get_mut(handle).ok_or(NetError::Unreach)?;
        output::send_fin(&pool, &*self.ip, tcb)
    }

    /// Flush whatever is currently queued in `tcb.send_buf`.
    pub fn transmit(&mut self, handle: TcbHandle) -> NetResult<()> {
        let pool = Arc::clone(&self.pool);
        let tcb = self.table.get_mut(handle).ok_or(NetError::Unreach)?;
        output::transmit(&pool, &*self.ip, tcb)
    }

    /// Advance the timer wheel and reap every TCB whose TIME_WAIT expired.
    pub fn tick(&mut self, elapsed_ms: u64) {
        self.timers.advance(elapsed_ms);
        let due: Vec<TcbHandle> = {
            let mut guard = self.expired.lock().expect("expiry queue poisoned");
            guard.drain(..).collect()
        };
        for handle in due {
            if self.table.remove(handle).is_some() {
                trace!("time_wait expired, tcb reaped");
            }
        }
    }
}

/// Drains `driver`'s RX queue into `exmsg` as fast as frames arrive. A real
/// deployment runs one of these per interface; it is the only producer
/// thread this crate spawns itself; application threads are the others.
pub fn spawn_rx_pump(
    driver: Arc<dyn NetDriver>,
    queue: Arc<ExMsgQueue>,
    netif_id: usize,
    poll_interval: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("netif-{netif_id}-rx"))
        .spawn(move || loop {
            match driver.recv() {
                Some((src_ip, packet)) => queue.send(ExMsg::RxFrame { netif_id, src_ip, packet }),
                None => std::thread::sleep(poll_interval),
            }
        })
        .expect("failed to spawn rx pump thread")
}

/// Run the worker's main loop on the calling thread. Never returns except
/// to let `shutdown` requests (an `ApiCall` that sets a flag) exit it; the
/// demo and the integration tests instead run this on a `std::thread`.
pub fn run(mut engine: Engine, queue: Arc<ExMsgQueue>, scan_period: Duration) {
    info!("protocol worker started");
    loop {
        match queue.recv_timeout(scan_period) {
            Some(ExMsg::RxFrame { netif_id, src_ip, packet }) => {
                trace!(netif_id, "rx frame");
                let local_ip = engine.local_ip;
                if let Err(e) = input::tcp_in(&mut engine, src_ip, local_ip, packet) {
                    trace!(error = ?e, "tcp_in dropped segment");
                }
            }
            Some(ExMsg::ApiCall(call)) => call(&mut engine),
            Some(ExMsg::TimerTick) | None => engine.tick(scan_period.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::platform::LoopbackIp;
    use crate::tcp::state::State;
    use crate::tcp::tcb::{FourTuple, Tcb};

    struct NullIp;
    impl Ipv4Out for NullIp {
        fn send(
            &self,
            _p: crate::platform::Protocol,
            _dst: Ipv4Addr,
            _src: Ipv4Addr,
            _seg: crate::pktbuf::PktBuf,
        ) -> crate::error::NetResult<()> {
            Ok(())
        }
    }

    #[test]
    fn time_wait_timer_reaps_tcb_after_2msl() {
        let config = NetConfig {
            tcp_msl_ms: 10,
            ..NetConfig::default()
        };
        let mut engine = Engine::new(&config, Box::new(NullIp), Ipv4Addr::new(10, 0, 0, 1));
        let handle = engine
            .table
            .insert(Tcb::new(
                FourTuple {
                    local_ip: Ipv4Addr::new(10, 0, 0, 1),
                    local_port: 80,
                    remote_ip: Ipv4Addr::new(10, 0, 0, 2),
                    remote_port: 4000,
                },
                State::TimeWait,
            ))
            .unwrap();
        engine.arm_time_wait(handle);
        assert!(engine.table.get(handle).is_some());
        engine.tick(25); // > 2*msl_ms
        assert!(engine.table.get(handle).is_none());
    }

    #[test]
    #[allow(dead_code)]
    fn loopback_ip_builds() {
        let driver = crate::platform::LoopbackDriver::new();
        let _ip = LoopbackIp::new(&driver);
    }
}
