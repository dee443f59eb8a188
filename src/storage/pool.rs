//! Space management collaborators of the tree
//!
//! The tree never owns storage directly: node reservations and payload bytes
//! go through an [`Allocator`], and releasing the bytes of removed records is
//! delegated to a [`FreeCallback`] policy chosen at creation time.

use ahash::AHashMap;
use bitvec::prelude::*;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{EvtError, Result};
use crate::storage::extent::BioAddr;

/// Default block size of the in-memory pool
pub const DEFAULT_BLOCK_SIZE: u64 = 64;

/// Reserves, releases and accesses physical space
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes
    fn alloc(&self, size: u64) -> Result<BioAddr>;

    /// Release a reservation made by `alloc`
    fn free(&self, addr: BioAddr, size: u64);

    /// Copy `bytes` to `addr`
    fn write(&self, addr: BioAddr, bytes: &[u8]) -> Result<()>;

    /// Copy `len` bytes out of `addr`
    fn read(&self, addr: BioAddr, len: u64) -> Result<Vec<u8>>;
}

/// Policy invoked when the tree drops a record that owns physical bytes
pub trait FreeCallback: Send + Sync {
    /// Dispose of `size` bytes at `addr`, reserved through `alloc`
    fn free(&self, alloc: &dyn Allocator, addr: BioAddr, size: u64) -> Result<()>;
}

/// Return space to the allocator right away
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateFree;

impl FreeCallback for ImmediateFree {
    fn free(&self, alloc: &dyn Allocator, addr: BioAddr, size: u64) -> Result<()> {
        alloc.free(addr, size);
        Ok(())
    }
}

/// Leave the bytes alone; the caller reclaims them some other way
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFree;

impl FreeCallback for NoFree {
    fn free(&self, _alloc: &dyn Allocator, addr: BioAddr, size: u64) -> Result<()> {
        trace!(%addr, size, "release skipped");
        Ok(())
    }
}

/// Queue releases and apply them in a batch with [`DeferredFree::drain`]
#[derive(Debug, Default)]
pub struct DeferredFree {
    queue: Mutex<Vec<(BioAddr, u64)>>,
}

impl DeferredFree {
    /// Policy with an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued releases
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Apply every queued release, returning how many were applied
    pub fn drain(&self, alloc: &dyn Allocator) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        for (addr, size) in &batch {
            alloc.free(*addr, *size);
        }
        batch.len()
    }
}

impl FreeCallback for DeferredFree {
    fn free(&self, _alloc: &dyn Allocator, addr: BioAddr, size: u64) -> Result<()> {
        self.queue.lock().push((addr, size));
        Ok(())
    }
}

/// Bookkeeping of the pool, guarded by a single lock
#[derive(Debug)]
struct PoolInner {
    /// One bit per block, set when in use
    occupancy: BitVec,
    /// Start block -> block count of every live reservation
    live: AHashMap<u64, usize>,
    /// Backing bytes
    data: Vec<u8>,
}

impl PoolInner {
    /// First-fit search for `blocks` free blocks in a row
    fn find_run(&self, blocks: usize) -> Option<usize> {
        let total = self.occupancy.len();
        let mut pos = 0;
        while pos + blocks <= total {
            match self.occupancy[pos..pos + blocks].last_one() {
                None => return Some(pos),
                Some(busy) => pos += busy + 1,
            }
        }
        None
    }
}

/// Fixed-capacity in-memory block pool
///
/// Space is handed out in whole blocks, first fit. Reading or writing outside
/// the pool fails with `InvalidArgument`; running out of blocks fails with
/// `OutOfMemory`.
#[derive(Debug)]
pub struct MemPool {
    block_size: u64,
    inner: Mutex<PoolInner>,
}

impl MemPool {
    /// Pool of `capacity` bytes rounded down to whole blocks
    pub fn new(capacity: u64, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        let blocks = (capacity / block_size) as usize;
        Self {
            block_size,
            inner: Mutex::new(PoolInner {
                occupancy: BitVec::repeat(false, blocks),
                live: AHashMap::new(),
                data: vec![0u8; blocks * block_size as usize],
            }),
        }
    }

    /// Pool of `capacity` bytes in blocks of [`DEFAULT_BLOCK_SIZE`]
    pub fn with_capacity(capacity: u64) -> Self {
        Self::new(capacity, DEFAULT_BLOCK_SIZE)
    }

    /// Granularity of reservations
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total bytes managed
    pub fn capacity(&self) -> u64 {
        self.inner.lock().occupancy.len() as u64 * self.block_size
    }

    /// Bytes currently reserved
    pub fn used(&self) -> u64 {
        self.inner.lock().occupancy.count_ones() as u64 * self.block_size
    }

    /// Number of outstanding reservations
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().live.len()
    }

    fn blocks_for(&self, size: u64) -> usize {
        size.div_ceil(self.block_size).max(1) as usize
    }

    fn check_range(&self, inner: &PoolInner, addr: BioAddr, len: u64) -> Result<usize> {
        let end = addr.0.checked_add(len);
        match end {
            Some(end) if !addr.is_hole() && end <= inner.data.len() as u64 => Ok(addr.0 as usize),
            _ => Err(EvtError::InvalidArgument(format!(
                "access of {} bytes at {} is outside the pool",
                len, addr
            ))),
        }
    }
}

impl Allocator for MemPool {
    fn alloc(&self, size: u64) -> Result<BioAddr> {
        let blocks = self.blocks_for(size);
        let mut inner = self.inner.lock();

        let start = inner.find_run(blocks).ok_or_else(|| {
            trace!(size, blocks, "pool exhausted");
            EvtError::OutOfMemory
        })?;
        inner.occupancy[start..start + blocks].fill(true);
        inner.live.insert(start as u64, blocks);

        Ok(BioAddr(start as u64 * self.block_size))
    }

    fn free(&self, addr: BioAddr, size: u64) {
        let mut inner = self.inner.lock();
        let start = addr.0 / self.block_size;

        let Some(blocks) = inner.live.remove(&start) else {
            warn!(%addr, size, "release of unknown reservation ignored");
            return;
        };
        if blocks != self.blocks_for(size) {
            warn!(%addr, size, blocks, "release size disagrees with reservation");
        }
        let start = start as usize;
        inner.occupancy[start..start + blocks].fill(false);
    }

    fn write(&self, addr: BioAddr, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let at = self.check_range(&inner, addr, bytes.len() as u64)?;
        inner.data[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, addr: BioAddr, len: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let at = self.check_range(&inner, addr, len)?;
        Ok(inner.data[at..at + len as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_alloc_free() {
        let pool = MemPool::new(256, 16);
        assert_eq!(pool.capacity(), 256);

        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(40).unwrap();
        assert_eq!(a, BioAddr(0));
        assert_eq!(b, BioAddr(16));
        assert_eq!(pool.used(), 64);
        assert_eq!(pool.live_allocations(), 2);

        pool.free(a, 10);
        assert_eq!(pool.used(), 48);

        // First fit reuses the released block
        let c = pool.alloc(16).unwrap();
        assert_eq!(c, BioAddr(0));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = MemPool::new(64, 16);
        let _a = pool.alloc(32).unwrap();
        let b = pool.alloc(16).unwrap();
        let _c = pool.alloc(16).unwrap();

        assert_eq!(pool.alloc(1), Err(EvtError::OutOfMemory));

        // Fragmented: one free block is not enough for two
        pool.free(b, 16);
        assert_eq!(pool.alloc(17), Err(EvtError::OutOfMemory));
        assert!(pool.alloc(16).is_ok());
    }

    #[test]
    fn test_pool_read_write() {
        let pool = MemPool::new(128, 16);
        let addr = pool.alloc(5).unwrap();

        pool.write(addr, b"hello").unwrap();
        assert_eq!(pool.read(addr, 5).unwrap(), b"hello");
        assert_eq!(pool.read(addr.offset(1), 3).unwrap(), b"ell");

        assert!(matches!(pool.read(BioAddr(120), 16), Err(EvtError::InvalidArgument(_))));
        assert!(matches!(pool.write(BioAddr::HOLE, b"x"), Err(EvtError::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_free_is_ignored() {
        let pool = MemPool::new(128, 16);
        let addr = pool.alloc(16).unwrap();

        pool.free(BioAddr(64), 16);
        assert_eq!(pool.live_allocations(), 1);
        pool.free(addr, 16);
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn test_free_policies() {
        let pool = MemPool::new(256, 16);
        let a = pool.alloc(16).unwrap();
        let b = pool.alloc(16).unwrap();
        let c = pool.alloc(16).unwrap();

        ImmediateFree.free(&pool, a, 16).unwrap();
        assert_eq!(pool.live_allocations(), 2);

        NoFree.free(&pool, b, 16).unwrap();
        assert_eq!(pool.live_allocations(), 2);

        let deferred = DeferredFree::new();
        deferred.free(&pool, b, 16).unwrap();
        deferred.free(&pool, c, 16).unwrap();
        assert_eq!(deferred.pending(), 2);
        assert_eq!(pool.live_allocations(), 2);

        assert_eq!(deferred.drain(&pool), 2);
        assert_eq!(deferred.pending(), 0);
        assert_eq!(pool.live_allocations(), 0);
    }
}
