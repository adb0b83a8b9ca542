//! Block buffer manager
//!
//! The blocks area of a direction is divided into `block_count` aligned
//! blocks of `block_size` bytes. A buffer occupies a contiguous run of
//! blocks; the first block starts with a u64 `size` header followed by the
//! payload. The sending side tracks its own runs in a local bitmap (one bit
//! per block, set while allocated); the receiving side only validates indices
//! it is handed and tells the sender when a buffer can be released.
//!
//! Everything read from a peer-written header is untrusted and range-checked
//! before use.

use crate::error::{ChannelError, Result};
use crate::region::SharedRegion;
use crate::BLOCK_HEADER_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::error;

/// One bit per block; set while the block is part of a live allocation
pub(crate) struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub(crate) fn test(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    /// Set `bit` and return its previous value
    pub(crate) fn test_and_set(&mut self, bit: usize) -> bool {
        let prev = self.test(bit);
        self.set(bit);
        prev
    }

    /// Clear `bit` and return its previous value
    pub(crate) fn test_and_clear(&mut self, bit: usize) -> bool {
        let prev = self.test(bit);
        self.clear(bit);
        prev
    }

    /// First-fit claim of `count` contiguous clear bits
    fn alloc_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for bit in 0..self.len {
            if self.test(bit) {
                run_len = 0;
                run_start = bit + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    for claimed in run_start..run_start + count {
                        self.set(claimed);
                    }
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Clear `count` bits starting at `start`; fails if any was already clear
    fn free_range(&mut self, start: usize, count: usize) -> Result<()> {
        if start + count > self.len {
            return Err(ChannelError::InvalidArgument(format!(
                "free of blocks {}..{} exceeds {} blocks",
                start,
                start + count,
                self.len
            )));
        }
        for bit in start..start + count {
            if !self.test(bit) {
                return Err(ChannelError::InvalidArgument(format!(
                    "block {} freed while not allocated",
                    bit
                )));
            }
        }
        for bit in start..start + count {
            self.clear(bit);
        }
        Ok(())
    }

    fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Geometry and validated access for one direction's blocks area
#[derive(Clone)]
pub struct BlockRegion {
    region: SharedRegion,
    block_size: usize,
    block_count: usize,
}

impl BlockRegion {
    /// Wrap a blocks-area view with the agreed geometry
    pub fn new(region: SharedRegion, block_size: usize, block_count: usize) -> Result<Self> {
        if block_size < 2 * BLOCK_HEADER_SIZE || block_size % BLOCK_HEADER_SIZE != 0 {
            return Err(ChannelError::InvalidArgument(format!(
                "block size {} is not a usable multiple of {}",
                block_size, BLOCK_HEADER_SIZE
            )));
        }
        if block_count == 0 || block_count > 256 {
            return Err(ChannelError::InvalidArgument(format!(
                "block count {} outside 1..=256",
                block_count
            )));
        }
        if block_size * block_count > region.len() {
            return Err(ChannelError::InvalidArgument(format!(
                "{} blocks of {} bytes exceed area of {} bytes",
                block_count,
                block_size,
                region.len()
            )));
        }
        Ok(Self {
            region,
            block_size,
            block_count,
        })
    }

    /// Size of one block in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks in the area
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Largest buffer the whole area could back
    pub fn max_buffer_len(&self) -> usize {
        self.block_size * self.block_count - BLOCK_HEADER_SIZE
    }

    /// Blocks needed to back `size` payload bytes plus the header
    pub fn blocks_for(&self, size: usize) -> usize {
        (size + BLOCK_HEADER_SIZE + self.block_size - 1) / self.block_size
    }

    fn offset_of(&self, index: usize) -> usize {
        index * self.block_size
    }

    fn data_offset(&self, index: usize) -> usize {
        self.offset_of(index) + BLOCK_HEADER_SIZE
    }

    pub(crate) fn write_header(&self, index: usize, size: usize) {
        self.region.write_u64(self.offset_of(index), size as u64);
    }

    /// Validate an externally supplied block index and the buffer size in its
    /// header. With `invalidate_cache` the header and (once its size is
    /// known) the payload are dropped from the local cache first, which is
    /// required before trusting anything the peer wrote.
    pub fn validate(&self, index: u8, invalidate_cache: bool) -> Result<usize> {
        let index = index as usize;
        if index >= self.block_count {
            return Err(ChannelError::InvalidArgument(format!(
                "block index {} outside {} blocks",
                index, self.block_count
            )));
        }
        if invalidate_cache {
            self.region.invalidate(self.offset_of(index), BLOCK_HEADER_SIZE);
            fence(Ordering::SeqCst);
        }
        let size = self.region.read_u64(self.offset_of(index)) as usize;
        if size > self.max_buffer_len()
            || self.data_offset(index) + size > self.block_size * self.block_count
        {
            return Err(ChannelError::Corrupted(format!(
                "block {} header claims {} bytes",
                index, size
            )));
        }
        if invalidate_cache {
            self.region.invalidate(self.data_offset(index), size);
            fence(Ordering::SeqCst);
        }
        Ok(size)
    }

    /// Copy payload bytes into the buffer starting at `index`
    pub fn write_data(&self, index: usize, data: &[u8]) {
        self.region.write_at(self.data_offset(index), data);
    }

    /// Copy `dst.len()` payload bytes out of the buffer starting at `index`
    pub fn read_data(&self, index: usize, dst: &mut [u8]) {
        self.region.read_at(self.data_offset(index), dst);
    }

    /// Borrow the payload of a validated buffer without copying.
    ///
    /// # Safety
    ///
    /// The run must stay owned (allocated TX grant or unreleased RX buffer)
    /// for the lifetime of the slice.
    pub unsafe fn data_bytes(&self, index: usize, len: usize) -> &[u8] {
        self.region.bytes(self.data_offset(index), len)
    }

    /// Borrow the payload of an owned TX grant mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive grant for the run.
    pub unsafe fn data_bytes_mut(&self, index: usize, len: usize) -> &mut [u8] {
        self.region.bytes_mut(self.data_offset(index), len)
    }

    /// Flush header and payload before handing the buffer to the peer
    pub fn flush_buffer(&self, index: usize, size: usize) {
        fence(Ordering::SeqCst);
        self.region
            .flush(self.offset_of(index), BLOCK_HEADER_SIZE + size);
    }
}

/// Grant over a freshly allocated TX block run
#[derive(Debug, Clone, Copy)]
pub struct TxGrant {
    /// First block of the run
    pub index: u8,
    /// Usable payload capacity (block-rounded allocation minus the header)
    pub capacity: usize,
}

/// Allocator for the local side's TX blocks area
pub struct BlockPool {
    blocks: BlockRegion,
    bitmap: Mutex<Bitmap>,
    freed: Notify,
}

impl BlockPool {
    /// Create an allocator with an empty bitmap over the given blocks area
    pub fn new(blocks: BlockRegion) -> Self {
        let bitmap = Mutex::new(Bitmap::new(blocks.block_count()));
        Self {
            blocks,
            bitmap,
            freed: Notify::new(),
        }
    }

    /// The blocks area this pool allocates from
    pub fn blocks(&self) -> &BlockRegion {
        &self.blocks
    }

    /// Number of blocks currently allocated
    pub fn used_blocks(&self) -> usize {
        self.bitmap.lock().count_set()
    }

    /// Allocate a buffer of at least `size` payload bytes.
    ///
    /// A request of zero claims one free block and greedily extends into
    /// adjacent free blocks. When no run is available the call waits on the
    /// freed gate and retries; the gate is released once per free, so a
    /// wakeup is only a hint and availability is re-checked. The grant's
    /// header is pre-filled with the full rounded capacity; sending adjusts
    /// it to the actual payload length.
    pub async fn allocate(&self, size: usize, timeout: Option<Duration>) -> Result<TxGrant> {
        if size > self.blocks.max_buffer_len() {
            return Err(ChannelError::OutOfMemory {
                requested: size,
                capacity: self.blocks.max_buffer_len(),
            });
        }
        let num_blocks = self.blocks.blocks_for(size);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut woken = false;

        let claimed = loop {
            let claimed = {
                let mut bitmap = self.bitmap.lock();
                match bitmap.alloc_contiguous(num_blocks) {
                    Some(first) if size == 0 => {
                        // Opportunistic sizing: take adjacent free blocks too.
                        let mut next = first + num_blocks;
                        while next < self.blocks.block_count() && !bitmap.test_and_set(next) {
                            next += 1;
                        }
                        Some((first, next - first))
                    }
                    Some(first) => Some((first, num_blocks)),
                    None => None,
                }
            };
            if let Some(claimed) = claimed {
                break Ok(claimed);
            }
            let wait = match deadline {
                None => {
                    self.freed.notified().await;
                    Ok(())
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        Err(ChannelError::Timeout(timeout.unwrap_or_default()))
                    } else {
                        tokio::time::timeout_at(deadline, self.freed.notified())
                            .await
                            .map_err(|_| ChannelError::Timeout(timeout.unwrap_or_default()))
                    }
                }
            };
            match wait {
                Ok(()) => woken = true,
                Err(e) => break Err(e),
            }
        };

        // A consumed wakeup does not mean all space was taken; pass it on so
        // another waiter re-checks.
        if woken {
            self.freed.notify_one();
        }

        let (first, count) = claimed?;
        let capacity = count * self.blocks.block_size() - BLOCK_HEADER_SIZE;
        self.blocks.write_header(first, capacity);
        Ok(TxGrant {
            index: first as u8,
            capacity,
        })
    }

    /// Release all blocks of the run at `index`, or shrink it to `new_size`
    /// payload bytes and release only the trailing blocks.
    ///
    /// Shrinking may not grow the run; `InvalidArgument` otherwise.
    pub fn release(&self, index: u8, new_size: Option<usize>) -> Result<()> {
        let size = self.blocks.validate(index, false)?;
        let index = index as usize;
        let num_blocks = self.blocks.blocks_for(size);

        let (release_start, release_count) = match new_size {
            Some(new_size) => {
                let new_num_blocks = self.blocks.blocks_for(new_size);
                if new_num_blocks > num_blocks {
                    error!(
                        requested = new_num_blocks,
                        allocated = num_blocks,
                        "shrink would grow the run"
                    );
                    return Err(ChannelError::InvalidArgument(format!(
                        "cannot shrink {} blocks to {}",
                        num_blocks, new_num_blocks
                    )));
                }
                self.blocks.write_header(index, new_size);
                (index + new_num_blocks, num_blocks - new_num_blocks)
            }
            None => (index, num_blocks),
        };

        if release_count > 0 {
            self.bitmap.lock().free_range(release_start, release_count)?;
            self.freed.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn pool(block_size: usize, block_count: usize) -> BlockPool {
        let region = SharedRegion::new_in_memory(block_size * block_count);
        BlockPool::new(BlockRegion::new(region, block_size, block_count).unwrap())
    }

    #[tokio::test]
    async fn test_block_math_scenario() {
        // 64-byte blocks, 8-byte header, 4 blocks.
        let pool = pool(64, 4);

        // 50 + 8 = 58 fits one block.
        let small = pool.allocate(50, None).await.unwrap();
        assert_eq!(small.capacity, 64 - 8);
        assert_eq!(pool.used_blocks(), 1);
        pool.release(small.index, None).unwrap();

        // 200 + 8 = 208 needs all four blocks.
        let big = pool.allocate(200, None).await.unwrap();
        assert_eq!(pool.used_blocks(), 4);
        assert_eq!(big.capacity, 4 * 64 - 8);

        // Nothing left until a release happens.
        let err = pool.allocate(1, Some(Duration::from_millis(20))).await;
        assert!(matches!(err, Err(ChannelError::Timeout(_))));
        pool.release(big.index, None).unwrap();
        assert_ok!(pool.allocate(1, Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn test_request_larger_than_area_fails_fast() {
        let pool = pool(64, 4);
        let err = pool.allocate(4 * 64, None).await.unwrap_err();
        assert!(matches!(err, ChannelError::OutOfMemory { .. }));
    }

    #[tokio::test]
    async fn test_zero_size_takes_whatever_is_free() {
        let pool = pool(64, 8);
        let pinned = pool.allocate(100, None).await.unwrap(); // blocks 0-1
        let greedy = pool.allocate(0, None).await.unwrap(); // blocks 2-7
        assert_eq!(greedy.capacity, 6 * 64 - 8);
        assert_eq!(pool.used_blocks(), 8);
        pool.release(pinned.index, None).unwrap();
        pool.release(greedy.index, None).unwrap();
        assert_eq!(pool.used_blocks(), 0);
    }

    #[tokio::test]
    async fn test_shrink_releases_trailing_blocks() {
        let pool = pool(64, 8);
        let grant = pool.allocate(0, None).await.unwrap(); // all 8 blocks
        assert_eq!(pool.used_blocks(), 8);

        pool.release(grant.index, Some(50)).unwrap(); // 50 + 8 = 58 fits one block
        assert_eq!(pool.used_blocks(), 1);
        assert_eq!(pool.blocks().validate(grant.index, false).unwrap(), 50);

        // Growing back is rejected.
        let err = pool.release(grant.index, Some(100)).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidArgument(_)));
        pool.release(grant.index, None).unwrap();
    }

    #[tokio::test]
    async fn test_allocation_waits_for_release() {
        let pool = std::sync::Arc::new(pool(64, 4));
        let grant = pool.allocate(200, None).await.unwrap();

        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(50, Some(Duration::from_secs(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(grant.index, None).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_peer_header_is_rejected() {
        let region = SharedRegion::new_in_memory(64 * 4);
        let blocks = BlockRegion::new(region.clone(), 64, 4).unwrap();
        region.write_u64(0, 10_000); // size far beyond the area
        let err = blocks.validate(0, true).unwrap_err();
        assert!(matches!(err, ChannelError::Corrupted(_)));
        assert!(blocks.validate(9, false).is_err());
    }

    #[test]
    fn test_bitmap_disjoint_runs() {
        let mut bitmap = Bitmap::new(16);
        let a = bitmap.alloc_contiguous(5).unwrap();
        let b = bitmap.alloc_contiguous(5).unwrap();
        let c = bitmap.alloc_contiguous(6).unwrap();
        let mut seen = vec![false; 16];
        for (start, count) in [(a, 5), (b, 5), (c, 6)] {
            for bit in start..start + count {
                assert!(!seen[bit], "overlapping allocation at {}", bit);
                seen[bit] = true;
            }
        }
        assert!(bitmap.alloc_contiguous(1).is_none());
        bitmap.free_range(b, 5).unwrap();
        assert_eq!(bitmap.alloc_contiguous(5).unwrap(), b);
    }

    #[test]
    fn test_bitmap_rejects_double_free() {
        let mut bitmap = Bitmap::new(8);
        let run = bitmap.alloc_contiguous(3).unwrap();
        bitmap.free_range(run, 3).unwrap();
        assert!(bitmap.free_range(run, 3).is_err());
    }
}
