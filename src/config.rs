//! Start-time configuration knobs.
//!
//! The original stack reads these from a compile-time `net_cfg.h`. A hosted
//! user-space stack can decide them at start-time instead, so this is a
//! plain struct with defaults matching the original constants.

/// Stack-wide configuration.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// Bytes per `pktbuf` block.
    pub pktbuf_blk_size: usize,
    /// Number of blocks in the fixed-block pool.
    pub pktbuf_blk_cnt: usize,
    /// Maximum number of concurrently live packet buffers.
    pub pktbuf_buf_cnt: usize,
    /// `exmsg` queue depth.
    pub exmsg_msg_cnt: usize,
    /// Per-interface inbound queue depth (driver boundary).
    pub netif_inq_size: usize,
    /// Per-interface outbound queue depth (driver boundary).
    pub netif_outq_size: usize,
    /// Timer wheel scan period, in milliseconds.
    pub timer_scan_period_ms: u64,
    /// Maximum live TCP control blocks.
    pub tcp_tcb_cnt: usize,
    /// Maximum simultaneous segment lifetime, in milliseconds (drives 2·MSL).
    pub tcp_msl_ms: u64,
    /// Advertised receive window for newly spawned connections.
    pub tcp_recv_wnd: u16,
    /// Entries in the original's ARP cache. This core has no ARP layer of
    /// its own (address resolution is the platform boundary's problem),
    /// carried only so a config struct built from the same `net_cfg.h`
    /// values slots in unchanged.
    pub arp_cache_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            pktbuf_blk_size: 128,
            pktbuf_blk_cnt: 100,
            pktbuf_buf_cnt: 100,
            exmsg_msg_cnt: 10,
            netif_inq_size: 50,
            netif_outq_size: 50,
            timer_scan_period_ms: 500,
            tcp_tcb_cnt: 64,
            tcp_msl_ms: 30_000,
            tcp_recv_wnd: 4096,
            arp_cache_size: 10,
        }
    }
}
