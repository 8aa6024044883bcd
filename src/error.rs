//! Error taxonomy shared by every fallible operation in the stack.
//!
//! Mirrors the original `net_err_t` kind set. `NET_ERR_OK` has no variant
//! here — success is the absence of an error, as is idiomatic in Rust.

use thiserror::Error;

/// A protocol-stack error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Fixed-block pool exhausted.
    #[error("packet buffer pool exhausted")]
    Mem,

    /// Malformed framing (too short, bad data offset, ...).
    #[error("malformed segment framing")]
    Size,

    /// TCP checksum mismatch.
    #[error("checksum mismatch")]
    Chksum,

    /// Semantically valid but unreachable (bad port, out-of-range ACK, ...).
    #[error("unreachable")]
    Unreach,

    /// Peer RST or local abort.
    #[error("connection reset")]
    Reset,

    /// Orderly close delivered to waiters.
    #[error("connection closed")]
    Close,

    /// Timeout on a wait descriptor.
    #[error("timed out")]
    Tmo,

    /// Underlying platform primitive failed.
    #[error("platform primitive failed")]
    Sys,

    /// Driver-level failure.
    #[error("driver I/O failure")]
    Io,
}

/// Convenience alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;
