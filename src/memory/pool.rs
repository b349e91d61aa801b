//! Power-of-two block allocator with free-list reuse

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Retained blocks per size class before overflow goes back to the system
const FREE_LIST_CAP: usize = 10;
/// Free-list length each class is pruned down to under memory pressure
const FREE_LIST_PRUNE_TO: usize = 5;

/// Pool errors
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("pool ceiling of {ceiling_mb} MB cannot satisfy {requested} bytes")]
    OutOfCapacity { requested: usize, ceiling_mb: u64 },

    #[error("invalid allocation size: {0}")]
    InvalidSize(usize),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Opaque identifier for a live block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u64);

/// An exclusively held block of pooled memory
///
/// The buffer belongs to the caller until handed back via
/// [`MemoryPool::deallocate`]. Dropping the block without deallocating
/// returns the bytes to the system allocator instead of the pool.
#[derive(Debug)]
pub struct PoolBlock {
    id: BlockId,
    buf: Vec<u8>,
}

impl PoolBlock {
    /// Identifier for this block
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Usable capacity (the rounded-up power of two)
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl std::ops::Deref for PoolBlock {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Free-list occupancy by size class
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Retained free blocks keyed by block size
    pub free_blocks_by_size: BTreeMap<usize, usize>,
    /// Bytes accounted against the ceiling (live + retained)
    pub pooled_bytes: u64,
    /// Currently checked-out blocks
    pub live_blocks: usize,
}

struct PoolInner {
    free: HashMap<usize, Vec<Vec<u8>>>,
    live: HashMap<u64, usize>,
    pooled_bytes: u64,
    next_id: u64,
}

/// Block allocator handing out power-of-two buffers
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
    ceiling_bytes: u64,
    ceiling_mb: u64,
}

impl MemoryPool {
    /// Create a pool with the given ceiling in megabytes
    pub fn new(ceiling_mb: u64) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: HashMap::new(),
                live: HashMap::new(),
                pooled_bytes: 0,
                next_id: 1,
            }),
            ceiling_bytes: ceiling_mb * 1024 * 1024,
            ceiling_mb,
        }
    }

    /// Allocate a block of at least `size` bytes
    ///
    /// The returned block is exclusive to the caller. Fails with
    /// [`PoolError::OutOfCapacity`] only after pruning retained free lists.
    pub fn allocate(&self, size: usize) -> PoolResult<PoolBlock> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }
        let class = size.next_power_of_two();
        let mut inner = self.inner.lock();

        // Reuse a retained block of the same class when one exists.
        if let Some(buf) = inner.free.get_mut(&class).and_then(|list| list.pop()) {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.live.insert(id, class);
            return Ok(PoolBlock {
                id: BlockId(id),
                buf,
            });
        }

        if inner.pooled_bytes + class as u64 > self.ceiling_bytes {
            Self::prune_free_lists(&mut inner);
            if inner.pooled_bytes + class as u64 > self.ceiling_bytes {
                return Err(PoolError::OutOfCapacity {
                    requested: size,
                    ceiling_mb: self.ceiling_mb,
                });
            }
        }

        inner.pooled_bytes += class as u64;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.live.insert(id, class);
        Ok(PoolBlock {
            id: BlockId(id),
            buf: vec![0u8; class],
        })
    }

    /// Return a block to the pool
    ///
    /// Unknown (stale) ids are a no-op, so double-deallocation through a
    /// retained id is harmless.
    pub fn deallocate(&self, block: PoolBlock) {
        let mut inner = self.inner.lock();
        let class = match inner.live.remove(&block.id.0) {
            Some(class) => class,
            None => return,
        };

        let list = inner.free.entry(class).or_default();
        if list.len() < FREE_LIST_CAP {
            let mut buf = block.buf;
            buf.iter_mut().for_each(|b| *b = 0);
            list.push(buf);
        } else {
            // List is full: release to the system allocator.
            inner.pooled_bytes = inner.pooled_bytes.saturating_sub(class as u64);
        }
    }

    fn prune_free_lists(inner: &mut PoolInner) {
        let mut released = 0u64;
        for (class, list) in inner.free.iter_mut() {
            while list.len() > FREE_LIST_PRUNE_TO {
                list.pop();
                released += *class as u64;
            }
        }
        inner.pooled_bytes = inner.pooled_bytes.saturating_sub(released);
        if released > 0 {
            tracing::debug!(released_bytes = released, "pruned pool free lists");
        }
    }

    /// Free-list occupancy and accounting
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            free_blocks_by_size: inner
                .free
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(class, list)| (*class, list.len()))
                .collect(),
            pooled_bytes: inner.pooled_bytes,
            live_blocks: inner.live.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_to_power_of_two() {
        let pool = MemoryPool::new(16);
        let block = pool.allocate(1000).unwrap();
        assert_eq!(block.capacity(), 1024);
        let block2 = pool.allocate(1024).unwrap();
        assert_eq!(block2.capacity(), 1024);
    }

    #[test]
    fn test_free_list_reuse() {
        let pool = MemoryPool::new(16);
        let block = pool.allocate(512).unwrap();
        pool.deallocate(block);

        let stats = pool.stats();
        assert_eq!(stats.free_blocks_by_size.get(&512), Some(&1));
        assert_eq!(stats.live_blocks, 0);

        // Reallocation drains the free list instead of growing the pool.
        let before = pool.stats().pooled_bytes;
        let _block = pool.allocate(512).unwrap();
        assert_eq!(pool.stats().pooled_bytes, before);
        assert!(pool.stats().free_blocks_by_size.get(&512).is_none());
    }

    #[test]
    fn test_free_list_capped_at_ten() {
        let pool = MemoryPool::new(16);
        let blocks: Vec<_> = (0..12).map(|_| pool.allocate(256).unwrap()).collect();
        for block in blocks {
            pool.deallocate(block);
        }
        assert_eq!(pool.stats().free_blocks_by_size.get(&256), Some(&10));
    }

    #[test]
    fn test_ceiling_prunes_then_fails() {
        // 1 MB ceiling: four 256 KB blocks fill it exactly.
        let pool = MemoryPool::new(1);
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(256 * 1024).unwrap()).collect();
        for block in blocks {
            pool.deallocate(block);
        }
        // All four retained; a larger request must prune retained blocks
        // down to five per class (already below) and then fail.
        assert_eq!(pool.stats().free_blocks_by_size.get(&(256 * 1024)), Some(&4));
        let err = pool.allocate(512 * 1024).unwrap_err();
        assert!(matches!(err, PoolError::OutOfCapacity { .. }));
    }

    #[test]
    fn test_prune_releases_excess_blocks() {
        // 2 MB ceiling, eight 256 KB retained blocks = 2 MB pooled.
        let pool = MemoryPool::new(2);
        let blocks: Vec<_> = (0..8).map(|_| pool.allocate(256 * 1024).unwrap()).collect();
        for block in blocks {
            pool.deallocate(block);
        }
        // Pruning to five frees three blocks, making room for this request.
        let block = pool.allocate(512 * 1024).unwrap();
        assert_eq!(block.capacity(), 512 * 1024);
        assert_eq!(pool.stats().free_blocks_by_size.get(&(256 * 1024)), Some(&5));
    }

    #[test]
    fn test_zero_size_rejected() {
        let pool = MemoryPool::new(1);
        assert!(matches!(
            pool.allocate(0),
            Err(PoolError::InvalidSize(0))
        ));
    }

    #[test]
    fn test_buffers_are_zeroed_on_reuse() {
        let pool = MemoryPool::new(1);
        let mut block = pool.allocate(64).unwrap();
        block[0] = 0xAB;
        pool.deallocate(block);

        let block = pool.allocate(64).unwrap();
        assert_eq!(block[0], 0);
    }
}
