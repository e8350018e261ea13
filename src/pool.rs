//! Process-wide pool of fixed-size blocks, one pool per element type.
//!
//! The chunked queues allocate storage exclusively through these pools, so
//! a build that churns through many queues recycles a small working set of
//! large allocations instead of hitting the allocator per block. The pool
//! is purely a cache: releasing a block keeps it on the free list until
//! [`BlockPool::shrink`] drops the list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// log2 of the number of elements per block.
pub const BLOCK_BITS: usize = 22;
/// Number of elements in one pool block.
pub const BLOCK_LEN: usize = 1 << BLOCK_BITS;

/// Free list plus instrumentation for one element type.
pub struct BlockPool<T> {
    free: Mutex<VecDeque<Box<[T]>>>,
    reserved: AtomicUsize,
    allocated: AtomicUsize,
}

/// Element types that queues may hold. Each implementor owns one static
/// pool; generic statics are not expressible in Rust, so the association
/// goes through this trait.
pub trait PoolItem: Copy + Default + Send + Sync + 'static {
    fn pool() -> &'static BlockPool<Self>;
}

impl<T: PoolItem> BlockPool<T> {
    const fn new() -> Self {
        BlockPool {
            free: Mutex::new(VecDeque::new()),
            reserved: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Hand out a block, reusing a released one when possible.
    pub fn reserve(&self) -> Box<[T]> {
        let recycled = self.free.lock().unwrap().pop_front();
        let block = match recycled {
            Some(block) => block,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![T::default(); BLOCK_LEN].into_boxed_slice()
            }
        };
        self.reserved.fetch_add(1, Ordering::Relaxed);
        block
    }

    /// Return a block to the free list.
    pub fn release(&self, block: Box<[T]>) {
        debug_assert_eq!(block.len(), BLOCK_LEN);
        self.free.lock().unwrap().push_back(block);
        self.reserved.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drop every block on the free list.
    pub fn shrink(&self) {
        let mut free = self.free.lock().unwrap();
        self.allocated.fetch_sub(free.len(), Ordering::Relaxed);
        free.clear();
    }

    /// Blocks currently lent out to queues.
    pub fn blocks_in_use(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Blocks ever allocated and not yet freed by `shrink`.
    pub fn blocks_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn log_usage(&self) {
        tracing::debug!(
            element_bytes = std::mem::size_of::<T>(),
            in_use = self.blocks_in_use(),
            allocated = self.blocks_allocated(),
            "block pool usage"
        );
    }
}

macro_rules! impl_pool_item {
    ($($t:ty),*) => {$(
        impl PoolItem for $t {
            fn pool() -> &'static BlockPool<Self> {
                static POOL: BlockPool<$t> = BlockPool::new();
                &POOL
            }
        }
    )*};
}

impl_pool_item!(u32, u64);

// The unit tests get a pool nothing else touches, so the counters can be
// asserted exactly even with tests running in parallel.
#[cfg(test)]
impl_pool_item!(u16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_recycled() {
        let pool = <u16 as PoolItem>::pool();
        let a = pool.reserve();
        assert_eq!(pool.blocks_in_use(), 1);
        assert_eq!(pool.blocks_allocated(), 1);
        pool.release(a);
        assert_eq!(pool.blocks_in_use(), 0);
        let b = pool.reserve();
        // The released block is handed back out, nothing new is allocated.
        assert_eq!(pool.blocks_allocated(), 1);
        assert_eq!(b.len(), BLOCK_LEN);
        pool.release(b);
        pool.shrink();
        assert_eq!(pool.blocks_allocated(), 0);
        assert_eq!(pool.blocks_in_use(), 0);
    }
}
