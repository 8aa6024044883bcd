//! The seam between this crate's protocol core and the outside world.
//!
//! The original core never talks to a NIC or an IP stack directly; it calls
//! `ipv4_out` and is handed frames by whatever sits below it. `NetDriver`
//! and `Ipv4Out` are that same boundary expressed as traits, so the core
//! can be driven by an in-memory loopback in tests and the bundled demo,
//! or by a real device and IP layer elsewhere.

use crate::error::NetResult;
use crate::pktbuf::PktBuf;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// The IP protocol number carried in the pseudo-header. This core only
/// ever emits TCP segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

/// A network interface's frame boundary: non-blocking RX poll, TX push.
pub trait NetDriver: Send + Sync {
    /// Poll for the next inbound frame, if any, alongside the IP address it
    /// arrived from. Never blocks.
    fn recv(&self) -> Option<(Ipv4Addr, PktBuf)>;
    /// Push a frame out onto the wire.
    fn send(&self, frame: PktBuf) -> NetResult<()>;
}

/// The outbound handoff to IP, invoked by the TCP output path's
/// `send_out`.
pub trait Ipv4Out: Send + Sync {
    fn send(&self, protocol: Protocol, dst: Ipv4Addr, src: Ipv4Addr, segment: PktBuf) -> NetResult<()>;
}

/// An in-memory loopback `NetDriver`: frames pushed with `send`/`send_from`
/// are queued for the next `recv`. Used by the integration tests and the
/// bundled demo binary in place of a real device.
#[derive(Default)]
pub struct LoopbackDriver {
    queue: Mutex<VecDeque<(Ipv4Addr, PktBuf)>>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` for the next `recv`, tagged with the address it
    /// "arrived" from. [`LoopbackIp::send`] uses this to carry the real
    /// source through the loop; tests pushing a frame directly can reach
    /// for the plain [`NetDriver::send`] when the source doesn't matter.
    pub fn send_from(&self, src_ip: Ipv4Addr, frame: PktBuf) -> NetResult<()> {
        self.queue
            .lock()
            .expect("loopback driver mutex poisoned")
            .push_back((src_ip, frame));
        Ok(())
    }
}

impl NetDriver for LoopbackDriver {
    fn recv(&self) -> Option<(Ipv4Addr, PktBuf)> {
        self.queue.lock().expect("loopback driver mutex poisoned").pop_front()
    }

    fn send(&self, frame: PktBuf) -> NetResult<()> {
        self.send_from(Ipv4Addr::UNSPECIFIED, frame)
    }
}

/// An in-memory `Ipv4Out` that loops every segment straight back into a
/// driver's RX queue, as if it had been routed out and immediately back in
/// over a point-to-point link.
pub struct LoopbackIp<'a> {
    driver: &'a LoopbackDriver,
}

impl<'a> LoopbackIp<'a> {
    pub fn new(driver: &'a LoopbackDriver) -> Self {
        Self { driver }
    }
}

impl Ipv4Out for LoopbackIp<'_> {
    fn send(&self, _protocol: Protocol, _dst: Ipv4Addr, src: Ipv4Addr, segment: PktBuf) -> NetResult<()> {
        self.driver.send_from(src, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::BlockPool;

    #[test]
    fn loopback_driver_echoes_sent_frames() {
        let driver = LoopbackDriver::new();
        let pool = BlockPool::new(64, 4);
        let buf = PktBuf::alloc(&pool, 8);
        assert!(driver.recv().is_none());
        driver.send(buf).unwrap();
        let received = driver.recv();
        assert!(received.is_some());
    }

    #[test]
    fn loopback_ip_hands_segment_to_driver() {
        let driver = LoopbackDriver::new();
        let ip = LoopbackIp::new(&driver);
        let pool = BlockPool::new(64, 4);
        let buf = PktBuf::alloc(&pool, 4);
        ip.send(Protocol::Tcp, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, buf)
            .unwrap();
        assert!(driver.recv().is_some());
    }
}
