//! Drives a full three-way handshake, a data exchange, and an orderly
//! close entirely over the in-memory [`LoopbackDriver`]/[`LoopbackIp`]
//! pair — no real NIC involved. Useful as a smoke test that the worker,
//! the state machine, and the socket API actually fit together end to end.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tcpip_core::config::NetConfig;
use tcpip_core::error::NetResult;
use tcpip_core::exmsg::ExMsgQueue;
use tcpip_core::platform::{Ipv4Out, LoopbackDriver, NetDriver, Protocol};
use tcpip_core::pktbuf::PktBuf;
use tcpip_core::socket::Socket;
use tcpip_core::worker::{self, Engine};

/// Hands segments straight to an `Arc<LoopbackDriver>`'s queue. `Engine::ip`
/// needs a `'static` trait object and `Arc::clone` is the ordinary way to
/// share that driver with the rx pump thread, so this demo-only adapter
/// stands in for `platform::LoopbackIp`'s borrowed-reference version.
struct ArcLoopbackIp(Arc<LoopbackDriver>);

impl Ipv4Out for ArcLoopbackIp {
    fn send(&self, _p: Protocol, _dst: Ipv4Addr, src: Ipv4Addr, segment: PktBuf) -> NetResult<()> {
        self.0.send_from(src, segment)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let local_ip = Ipv4Addr::new(127, 0, 0, 1);
    let config = NetConfig::default();

    let driver = Arc::new(LoopbackDriver::new());
    let ip = ArcLoopbackIp(Arc::clone(&driver));

    let engine = Engine::new(&config, Box::new(ip), local_ip);
    let queue = Arc::new(ExMsgQueue::new(config.exmsg_msg_cnt));

    let driver_dyn: Arc<dyn NetDriver> = driver;
    let _rx_pump = worker::spawn_rx_pump(driver_dyn, Arc::clone(&queue), 0, Duration::from_millis(5));

    let worker_queue = Arc::clone(&queue);
    let scan_period = Duration::from_millis(50);
    std::thread::spawn(move || worker::run(engine, worker_queue, scan_period));

    let listener = Socket::listen(Arc::clone(&queue), Ipv4Addr::UNSPECIFIED, 7000)
        .expect("listen should succeed against a fresh engine");

    let server_queue = Arc::clone(&queue);
    let server = std::thread::spawn(move || {
        let conn = listener.accept().expect("accept should complete");
        let mut buf = [0u8; 64];
        let n = conn.recv(&mut buf).expect("recv should see the client's bytes");
        println!("server received: {:?}", std::str::from_utf8(&buf[..n]).unwrap());
        conn.close().expect("close should queue a fin");
        let _ = server_queue;
    });

    let client = Socket::connect(Arc::clone(&queue), local_ip, 40000, local_ip, 7000)
        .expect("connect should complete the handshake");
    client.send(b"hello from the loopback demo").expect("send should queue and flush");
    client.close().expect("close should queue a fin");

    server.join().expect("server thread panicked");
    println!("loopback demo finished");
}
