//! Chained, scatter-gather packet buffers.
//!
//! A [`PktBuf`] is a chain of fixed-size [`block::Block`]s drawn from a
//! shared [`pool::BlockPool`]. Only the first block ever carries unused
//! headroom; every push (`add_header`) and pop (`remove_header`) happens
//! against that first block so that protocol headers can be prepended
//! without copying the payload that follows them. A cursor tracks the
//! current read/write position across block boundaries for sequential
//! I/O, mirroring the original's `pktbuf_acc_reset` / `pktbuf_read` /
//! `pktbuf_write` pair.

mod block;
pub mod pool;

use block::Block;
pub use pool::BlockPool;

use crate::error::{NetError, NetResult};
use std::sync::Arc;
use std::time::Duration;

/// Tracks the current position for sequential reads and writes across a
/// block chain.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    /// Logical offset from the start of the buffer's used data.
    pos: usize,
    /// Index of the block the cursor currently sits in.
    block: usize,
    /// Offset within that block's used region.
    offset: usize,
}

/// A chained packet buffer.
///
/// Exclusively owned by whichever component currently holds it; blocks are
/// returned to the pool either explicitly via [`PktBuf::free`] or
/// automatically when the buffer is dropped.
pub struct PktBuf {
    pool: Arc<BlockPool>,
    blocks: Vec<Block>,
    total: usize,
    cursor: Cursor,
}

impl PktBuf {
    /// Allocate a buffer with `size` bytes of usable payload, blocking until
    /// enough blocks are free.
    pub fn alloc(pool: &Arc<BlockPool>, size: usize) -> Self {
        let blocks = Self::take_blocks(pool, size, |p| p.alloc_block_blocking());
        Self::from_blocks(pool, blocks, size)
    }

    /// Allocate a buffer with `size` bytes of usable payload, failing with
    /// [`NetError::Mem`] rather than blocking if the pool cannot satisfy it
    /// immediately.
    pub fn try_alloc(pool: &Arc<BlockPool>, size: usize) -> NetResult<Self> {
        let needed = Self::blocks_needed(pool, size);
        if pool.free_count() < needed {
            return Err(NetError::Mem);
        }
        let mut storages = Vec::with_capacity(needed);
        for _ in 0..needed {
            match pool.try_alloc_block() {
                Ok(s) => storages.push(s),
                Err(e) => {
                    for s in storages {
                        pool.free_block(s);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_blocks(pool, storages.into_iter().map(Block::from_storage).collect(), size))
    }

    /// Allocate with a bound on how long to wait for free blocks.
    pub fn alloc_timeout(pool: &Arc<BlockPool>, size: usize, timeout: Duration) -> NetResult<Self> {
        let needed = Self::blocks_needed(pool, size);
        let mut storages = Vec::with_capacity(needed);
        for _ in 0..needed {
            match pool.alloc_block_timeout(timeout) {
                Ok(s) => storages.push(s),
                Err(e) => {
                    for s in storages {
                        pool.free_block(s);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_blocks(pool, storages.into_iter().map(Block::from_storage).collect(), size))
    }

    fn blocks_needed(pool: &BlockPool, size: usize) -> usize {
        if size == 0 {
            1
        } else {
            (size + pool.blk_size() - 1) / pool.blk_size()
        }
    }

    fn take_blocks(pool: &Arc<BlockPool>, size: usize, alloc_one: impl Fn(&BlockPool) -> Vec<u8>) -> Vec<Block> {
        let needed = Self::blocks_needed(pool, size);
        (0..needed).map(|_| Block::from_storage(alloc_one(pool))).collect()
    }

    /// Lay `size` bytes of used data out across freshly taken blocks,
    /// reserving any leftover block capacity as headroom on the first block
    /// so that a later `add_header` doesn't need to copy the payload.
    fn from_blocks(pool: &Arc<BlockPool>, mut blocks: Vec<Block>, size: usize) -> Self {
        let total_capacity: usize = blocks.iter().map(Block::capacity).sum();
        let slack = total_capacity - size;
        for (i, block) in blocks.iter_mut().enumerate() {
            let cap = block.capacity();
            block.grow_tail(cap);
            if i == 0 {
                block.shrink_head(slack.min(cap));
            }
        }
        Self {
            pool: Arc::clone(pool),
            blocks,
            total: size,
            cursor: Cursor::default(),
        }
    }

    /// Total number of used bytes across the whole chain.
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Number of blocks currently in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Return every block to the pool. Equivalent to dropping the buffer;
    /// kept as an explicit operation for call sites that want the release
    /// to read as intentional.
    pub fn free(self) {
        drop(self)
    }

    /// Prepend `len` bytes of header space at the front of the chain.
    ///
    /// If the first block's headroom already covers `len`, the push lands
    /// there and nothing else moves. Otherwise a fresh block is drawn from
    /// the pool and linked in front: with `force_cont` set the whole region
    /// must land contiguously in that one new block (the existing head-gap,
    /// too small to hold it, is left alone), while without it the head-gap
    /// is filled first and only the remainder goes into the new block. This
    /// mirrors the original `pktbuf_add_header`'s block-linking behavior.
    pub fn add_header(&mut self, len: usize, force_cont: bool) -> NetResult<()> {
        let first_headroom = self.blocks.first().ok_or(NetError::Size)?.headroom();
        if first_headroom >= len {
            self.blocks[0].grow_head(len);
        } else if force_cont {
            self.link_fresh_block(len)?;
        } else {
            let remaining = len - first_headroom;
            self.blocks[0].grow_head(first_headroom);
            self.link_fresh_block(remaining)?;
        }
        self.total += len;
        self.cursor = Cursor::default();
        if force_cont {
            self.set_cont(len)?;
        }
        Ok(())
    }

    /// Draw a fresh block from the pool and link it in front of the chain
    /// with `used_len` bytes of used space at its tail (and whatever
    /// capacity is left over as headroom, for the next push).
    fn link_fresh_block(&mut self, used_len: usize) -> NetResult<()> {
        let blk_size = self.pool.blk_size();
        if used_len > blk_size {
            return Err(NetError::Size);
        }
        let storage = self.pool.alloc_block_blocking();
        let mut fresh = Block::from_storage(storage);
        fresh.grow_tail(blk_size);
        fresh.shrink_head(blk_size - used_len);
        self.blocks.insert(0, fresh);
        Ok(())
    }

    /// Drop `len` bytes from the front of the chain (a header pop).
    pub fn remove_header(&mut self, len: usize) -> NetResult<()> {
        if len > self.total {
            return Err(NetError::Size);
        }
        let mut remaining = len;
        while remaining > 0 {
            let first = self.blocks.first_mut().expect("total_size desynchronized");
            let take = remaining.min(first.len());
            first.shrink_head(take);
            remaining -= take;
            self.total -= take;
            if first.len() == 0 && self.blocks.len() > 1 {
                let drained = self.blocks.remove(0);
                self.pool.free_block(drained.into_storage());
            }
        }
        self.cursor = Cursor::default();
        Ok(())
    }

    /// Grow or shrink the logical size of the buffer from the tail.
    ///
    /// Growing claims tailroom from the last block, allocating fresh blocks
    /// from the pool as needed; shrinking releases bytes (and, once a block
    /// is fully drained, the block itself) from the back.
    pub fn resize(&mut self, new_size: usize) -> NetResult<()> {
        if new_size > self.total {
            let mut grow_by = new_size - self.total;
            while grow_by > 0 {
                let last = self.blocks.last_mut().expect("chain is never empty");
                let room = last.tailroom();
                if room == 0 {
                    let storage = self.pool.try_alloc_block()?;
                    self.blocks.push(Block::from_storage(storage));
                    continue;
                }
                let take = grow_by.min(room);
                last.grow_tail(take);
                grow_by -= take;
                self.total += take;
            }
        } else {
            let mut shrink_by = self.total - new_size;
            while shrink_by > 0 {
                let last = self.blocks.last_mut().expect("chain is never empty");
                let take = shrink_by.min(last.len());
                last.shrink_tail(take);
                shrink_by -= take;
                self.total -= take;
                if last.len() == 0 && self.blocks.len() > 1 {
                    let drained = self.blocks.pop().expect("checked len above");
                    self.pool.free_block(drained.into_storage());
                }
            }
        }
        if self.cursor.pos > self.total {
            self.cursor = Cursor::default();
        }
        Ok(())
    }

    /// Append `other`'s data onto the end of `self`, consuming `other`
    /// without returning its blocks to the pool (they now belong to `self`).
    pub fn join(&mut self, mut other: PktBuf) {
        self.total += other.total;
        self.blocks.append(&mut other.blocks);
        // `other.blocks` is now empty, so dropping it returns nothing.
    }

    /// Force the first `len` bytes of the chain to be contiguous in memory,
    /// merging blocks as needed. Used before reading or writing a header
    /// struct directly rather than field-by-field.
    pub fn set_cont(&mut self, len: usize) -> NetResult<()> {
        if len > self.total {
            return Err(NetError::Size);
        }
        if len == 0 {
            return Ok(());
        }
        while self.blocks[0].len() < len {
            if self.blocks.len() < 2 {
                return Err(NetError::Size);
            }
            let next = self.blocks.remove(1);
            let first = &mut self.blocks[0];
            if next.len() > first.tailroom() {
                // Not enough room to merge in place; this only happens when
                // headroom elsewhere makes the chain tighter than its raw
                // capacity, which `add_header`/`resize` never produce, but
                // guard against it rather than panic.
                return Err(NetError::Size);
            }
            let bytes: Vec<u8> = next.used().to_vec();
            first.grow_tail(bytes.len());
            let dst_start = first.len() - bytes.len();
            first.used_mut()[dst_start..].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Reset the read/write cursor to the start of the buffer.
    pub fn seek_start(&mut self) {
        self.cursor = Cursor::default();
    }

    /// Move the cursor to an absolute byte offset.
    pub fn seek(&mut self, pos: usize) -> NetResult<()> {
        if pos > self.total {
            return Err(NetError::Size);
        }
        let mut remaining = pos;
        let mut block = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            if remaining <= b.len() {
                block = i;
                break;
            }
            remaining -= b.len();
            block = i + 1;
        }
        self.cursor = Cursor {
            pos,
            block,
            offset: remaining,
        };
        Ok(())
    }

    /// Read `dst.len()` bytes starting at the cursor, advancing it.
    pub fn read(&mut self, dst: &mut [u8]) -> NetResult<()> {
        if self.cursor.pos + dst.len() > self.total {
            return Err(NetError::Size);
        }
        let mut written = 0;
        while written < dst.len() {
            let block = self.blocks.get(self.cursor.block).ok_or(NetError::Size)?;
            let available = block.len() - self.cursor.offset;
            let take = (dst.len() - written).min(available);
            dst[written..written + take]
                .copy_from_slice(&block.used()[self.cursor.offset..self.cursor.offset + take]);
            written += take;
            self.cursor.offset += take;
            self.cursor.pos += take;
            if self.cursor.offset == block.len() && written < dst.len() {
                self.cursor.block += 1;
                self.cursor.offset = 0;
            }
        }
        Ok(())
    }

    /// Write `src` starting at the cursor, advancing it. The destination
    /// range must already be part of the buffer's used data (grow with
    /// [`PktBuf::resize`] or [`PktBuf::add_header`] first).
    pub fn write(&mut self, src: &[u8]) -> NetResult<()> {
        if self.cursor.pos + src.len() > self.total {
            return Err(NetError::Size);
        }
        let mut read = 0;
        while read < src.len() {
            let block = self.blocks.get_mut(self.cursor.block).ok_or(NetError::Size)?;
            let available = block.len() - self.cursor.offset;
            let take = (src.len() - read).min(available);
            block.used_mut()[self.cursor.offset..self.cursor.offset + take]
                .copy_from_slice(&src[read..read + take]);
            read += take;
            self.cursor.offset += take;
            self.cursor.pos += take;
            if self.cursor.offset == block.len() && read < src.len() {
                self.cursor.block += 1;
                self.cursor.offset = 0;
            }
        }
        Ok(())
    }

    /// Fill `len` bytes starting at the cursor with `value`, advancing it.
    pub fn fill(&mut self, value: u8, len: usize) -> NetResult<()> {
        let chunk = vec![value; len];
        self.write(&chunk)
    }

    /// Copy `len` bytes from `src`'s cursor to `dst`'s cursor, advancing
    /// both.
    pub fn copy(dst: &mut PktBuf, src: &mut PktBuf, len: usize) -> NetResult<()> {
        let mut buf = vec![0u8; len];
        src.read(&mut buf)?;
        dst.write(&buf)
    }

    /// Borrow the first `len` bytes as one contiguous slice. Call
    /// [`PktBuf::set_cont`] first if `len` might span the original block
    /// boundary.
    pub fn contiguous(&self, len: usize) -> NetResult<&[u8]> {
        let first = self.blocks.first().ok_or(NetError::Size)?;
        if first.len() < len {
            return Err(NetError::Size);
        }
        Ok(&first.used()[..len])
    }

    /// Mutably borrow the first `len` bytes as one contiguous slice.
    pub fn contiguous_mut(&mut self, len: usize) -> NetResult<&mut [u8]> {
        let first = self.blocks.first_mut().ok_or(NetError::Size)?;
        if first.len() < len {
            return Err(NetError::Size);
        }
        Ok(&mut first.used_mut()[..len])
    }
}

impl Drop for PktBuf {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.pool.free_block(block.into_storage());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(blk_size: usize, blk_cnt: usize) -> Arc<BlockPool> {
        BlockPool::new(blk_size, blk_cnt)
    }

    #[test]
    fn alloc_spans_multiple_blocks() {
        let p = pool(8, 10);
        let buf = PktBuf::alloc(&p, 20);
        assert_eq!(buf.total_size(), 20);
        assert_eq!(buf.block_count(), 3);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let p = pool(8, 10);
        let mut buf = PktBuf::alloc(&p, 16);
        buf.write(b"0123456789abcdef").unwrap();
        buf.seek_start();
        let mut out = [0u8; 16];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"0123456789abcdef");
    }

    #[test]
    fn add_and_remove_header_preserves_payload() {
        let p = pool(16, 10);
        let mut buf = PktBuf::alloc(&p, 8);
        buf.write(b"PAYLOAD!").unwrap();
        buf.add_header(4, true).unwrap();
        buf.seek_start();
        buf.write(b"HDR!").unwrap();
        assert_eq!(buf.total_size(), 12);
        buf.remove_header(4).unwrap();
        buf.seek_start();
        let mut out = [0u8; 8];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"PAYLOAD!");
    }

    #[test]
    fn set_cont_merges_blocks() {
        let p = pool(4, 10);
        let mut buf = PktBuf::alloc(&p, 10);
        buf.write(b"0123456789").unwrap();
        buf.set_cont(6).unwrap();
        assert_eq!(buf.contiguous(6).unwrap(), b"012345");
    }

    #[test]
    fn join_concatenates_and_frees_nothing_twice() {
        let p = pool(8, 10);
        let mut a = PktBuf::alloc(&p, 4);
        a.write(b"abcd").unwrap();
        let mut b = PktBuf::alloc(&p, 4);
        b.write(b"efgh").unwrap();
        a.join(b);
        assert_eq!(a.total_size(), 8);
        a.seek_start();
        let mut out = [0u8; 8];
        a.read(&mut out).unwrap();
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn resize_grow_then_shrink() {
        let p = pool(8, 10);
        let mut buf = PktBuf::alloc(&p, 4);
        buf.resize(12).unwrap();
        assert_eq!(buf.total_size(), 12);
        buf.resize(2).unwrap();
        assert_eq!(buf.total_size(), 2);
    }

    #[test]
    fn drop_returns_every_block_to_the_pool() {
        let p = pool(4, 4);
        {
            let _buf = PktBuf::alloc(&p, 16);
            assert_eq!(p.free_count(), 0);
        }
        assert_eq!(p.free_count(), 4);
    }

    #[test]
    fn pool_exhaustion_surfaces_as_mem_error() {
        let p = pool(4, 1);
        let _held = PktBuf::alloc(&p, 4);
        assert!(matches!(PktBuf::try_alloc(&p, 4), Err(NetError::Mem)));
    }
}
