//! Fixed-block allocator backing every [`super::PktBuf`].
//!
//! Grounded on the original `mblock` allocator: a fixed number of
//! fixed-size blocks are carved out up front, handed out from a free list,
//! and a counting semaphore tracks how many are currently free so that a
//! blocking allocation can park the caller instead of failing outright.

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::sync::{Mutex, Semaphore};
use std::sync::Arc;
use std::time::Duration;

/// Shared pool of fixed-size byte blocks.
///
/// Cloned via `Arc` by every [`super::PktBuf`] it services, so blocks can be
/// returned to the pool from whichever thread last holds the buffer.
pub struct BlockPool {
    free: Mutex<Vec<Vec<u8>>>,
    available: Semaphore,
    blk_size: usize,
    blk_cnt: usize,
}

impl BlockPool {
    /// Preallocate `blk_cnt` blocks of `blk_size` bytes each.
    pub fn new(blk_size: usize, blk_cnt: usize) -> Arc<Self> {
        let free = (0..blk_cnt).map(|_| vec![0u8; blk_size]).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            available: Semaphore::new(blk_cnt),
            blk_size,
            blk_cnt,
        })
    }

    /// Build a pool sized from the stack's configuration.
    pub fn from_config(config: &NetConfig) -> Arc<Self> {
        Self::new(config.pktbuf_blk_size, config.pktbuf_blk_cnt)
    }

    pub fn blk_size(&self) -> usize {
        self.blk_size
    }

    pub fn blk_cnt(&self) -> usize {
        self.blk_cnt
    }

    /// Number of blocks currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Take one block, blocking until one is available.
    pub(crate) fn alloc_block_blocking(&self) -> Vec<u8> {
        self.available.wait();
        self.take_free_block()
    }

    /// Take one block, blocking until one is available or `timeout` elapses.
    pub(crate) fn alloc_block_timeout(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        if self.available.wait_timeout(timeout) {
            Ok(self.take_free_block())
        } else {
            Err(NetError::Tmo)
        }
    }

    /// Take one block without blocking; fails with [`NetError::Mem`] if the
    /// pool is exhausted.
    pub(crate) fn try_alloc_block(&self) -> NetResult<Vec<u8>> {
        if self.available.try_wait() {
            Ok(self.take_free_block())
        } else {
            Err(NetError::Mem)
        }
    }

    fn take_free_block(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .expect("semaphore count desynchronized from free list")
    }

    /// Return a block to the pool, waking one blocked allocator.
    pub(crate) fn free_block(&self, mut storage: Vec<u8>) {
        storage.clear();
        storage.resize(self.blk_size, 0);
        self.free.lock().push(storage);
        self.available.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_pool_fails_fast() {
        let pool = BlockPool::new(16, 1);
        let block = pool.try_alloc_block().unwrap();
        assert!(pool.try_alloc_block().is_err());
        pool.free_block(block);
        assert!(pool.try_alloc_block().is_ok());
    }

    #[test]
    fn freed_block_is_zeroed() {
        let pool = BlockPool::new(4, 1);
        let mut block = pool.try_alloc_block().unwrap();
        block.copy_from_slice(&[1, 2, 3, 4]);
        pool.free_block(block);
        let block = pool.try_alloc_block().unwrap();
        assert_eq!(block, vec![0, 0, 0, 0]);
    }

    #[test]
    fn alloc_timeout_reports_exhaustion() {
        let pool = BlockPool::new(8, 1);
        let _held = pool.try_alloc_block().unwrap();
        let result = pool.alloc_block_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(NetError::Tmo)));
    }
}
