//! Chunked FIFO of fixed-size, pool-backed blocks.
//!
//! `ChunkedQueue` is the staging structure for the out-of-core index build:
//! an append-only, pop-front sequence with O(1) amortized bulk push/pop and
//! O(1) random reads. Blocks come from the per-type [`BlockPool`] and are
//! handed back as soon as they drain, so the live footprint tracks the
//! logical size instead of the high-water mark.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::ops::Index;

use crate::io::LeField;
use crate::pool::{BlockPool, PoolItem, BLOCK_BITS, BLOCK_LEN};

struct Block<T: PoolItem> {
    data: Option<Box<[T]>>,
    start: usize,
    end: usize,
}

impl<T: PoolItem> Block<T> {
    fn new() -> Self {
        Block {
            data: Some(T::pool().reserve()),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    fn data(&self) -> &[T] {
        self.data.as_deref().unwrap()
    }

    #[inline]
    fn pushable(&self) -> usize {
        BLOCK_LEN - self.end
    }

    #[inline]
    fn poppable(&self) -> usize {
        self.end - self.start
    }

    /// Copy in as many of `src` as fit, returning how many that was.
    fn push(&mut self, src: &[T]) -> usize {
        let n = self.pushable().min(src.len());
        let data = self.data.as_deref_mut().unwrap();
        data[self.end..self.end + n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Copy out up to `dst.len()` elements, returning how many were moved.
    fn pop(&mut self, dst: &mut [T]) -> usize {
        let n = self.poppable().min(dst.len());
        let data = self.data.as_deref().unwrap();
        dst[..n].copy_from_slice(&data[self.start..self.start + n]);
        self.start += n;
        if self.poppable() == 0 {
            self.start = 0;
            self.end = 0;
        }
        n
    }
}

impl<T: PoolItem> Drop for Block<T> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            T::pool().release(data);
        }
    }
}

/// Bounded-memory FIFO of `T` with random reads.
pub struct ChunkedQueue<T: PoolItem> {
    blocks: VecDeque<Block<T>>,
    len: usize,
}

impl<T: PoolItem> Default for ChunkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolItem> ChunkedQueue<T> {
    pub fn new() -> Self {
        ChunkedQueue {
            blocks: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bulk-append `src`, growing by pool blocks as the tail fills.
    /// Existing blocks are never reallocated or moved.
    pub fn push_back(&mut self, src: &[T]) {
        let mut rest = src;
        while !rest.is_empty() {
            if self.blocks.back().map_or(true, |b| b.pushable() == 0) {
                self.blocks.push_back(Block::new());
            }
            let n = self.blocks.back_mut().unwrap().push(rest);
            rest = &rest[n..];
            self.len += n;
        }
    }

    /// Bulk-pop into `dst`, returning `min(dst.len(), self.len())`.
    /// Drained head blocks go back to the pool.
    pub fn pop_front(&mut self, dst: &mut [T]) -> usize {
        let mut filled = 0;
        while filled < dst.len() {
            let Some(head) = self.blocks.front_mut() else {
                break;
            };
            let n = head.pop(&mut dst[filled..]);
            filled += n;
            self.len -= n;
            if self.blocks.front().map_or(false, |b| b.poppable() == 0) {
                self.blocks.pop_front();
            }
        }
        filled
    }

    /// Pop up to `n` elements directly into another queue, block slice by
    /// block slice, with no intermediate buffer.
    pub fn pop_front_into(&mut self, dst: &mut ChunkedQueue<T>, n: usize) -> usize {
        let mut remaining = n;
        while remaining > 0 {
            let Some(head) = self.blocks.front_mut() else {
                break;
            };
            let take = head.poppable().min(remaining);
            if take > 0 {
                let data = head.data();
                dst.push_back(&data[head.start..head.start + take]);
                head.start += take;
                remaining -= take;
                self.len -= take;
            }
            if self.blocks.front().map_or(false, |b| b.poppable() == 0) {
                self.blocks.pop_front();
            }
        }
        n - remaining
    }

    /// Release every block and reset to empty.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    /// Iterate the logical contents without consuming them.
    pub fn iter(&self) -> QueueIter<'_, T> {
        self.range(0, self.len)
    }

    /// Iterate the logical range `[start, end)`.
    pub fn range(&self, start: usize, end: usize) -> QueueIter<'_, T> {
        assert!(start <= end && end <= self.len, "queue range out of bounds");
        QueueIter {
            queue: self,
            next: start,
            end,
        }
    }

    /// Serialize as the logical size followed by the live contents.
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()>
    where
        T: LeField,
    {
        (self.len as u64).write_le(w)?;
        for block in &self.blocks {
            crate::io::write_slice(w, &block.data()[block.start..block.end])?;
        }
        Ok(())
    }

    /// Inverse of [`dump`](Self::dump). Loading over live contents is a bug.
    pub fn load<R: Read>(&mut self, r: &mut R) -> std::io::Result<()>
    where
        T: LeField,
    {
        assert!(self.is_empty(), "loading into a non-empty queue");
        let mut remaining = u64::read_le(r)? as usize;
        self.len = remaining;
        while remaining > 0 {
            let n = remaining.min(BLOCK_LEN);
            let mut block = Block::new();
            {
                let data = block.data.as_deref_mut().unwrap();
                for slot in &mut data[..n] {
                    *slot = T::read_le(r)?;
                }
            }
            block.end = n;
            self.blocks.push_back(block);
            remaining -= n;
        }
        Ok(())
    }

    /// Pool bookkeeping for this element type.
    pub fn pool() -> &'static BlockPool<T> {
        T::pool()
    }
}

impl<T: PoolItem> Index<usize> for ChunkedQueue<T> {
    type Output = T;

    /// O(1) random read. The physical mapping `blocks[i / B][i % B]` holds
    /// while the head block has not been partially drained, which is the
    /// case for every consumer here: partition planning and binary searches
    /// run strictly before popping starts.
    #[inline]
    fn index(&self, i: usize) -> &T {
        assert!(i < self.len, "queue index out of bounds");
        &self.blocks[i >> BLOCK_BITS].data()[i & (BLOCK_LEN - 1)]
    }
}

pub struct QueueIter<'a, T: PoolItem> {
    queue: &'a ChunkedQueue<T>,
    next: usize,
    end: usize,
}

impl<T: PoolItem> Iterator for QueueIter<'_, T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<T> {
        if self.next == self.end {
            return None;
        }
        let v = self.queue[self.next];
        self.next += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end - self.next;
        (n, Some(n))
    }
}

impl<T: PoolItem> ExactSizeIterator for QueueIter<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> Vec<u32> {
        (0..n as u32).map(|i| i.wrapping_mul(2_654_435_761)).collect()
    }

    #[test]
    fn push_pop_round_trip() {
        let input = filled(BLOCK_LEN + 123_456);
        let mut q = ChunkedQueue::new();
        q.push_back(&input);
        assert_eq!(q.len(), input.len());

        let mut out = vec![0u32; input.len()];
        let popped = q.pop_front(&mut out);
        assert_eq!(popped, input.len());
        assert_eq!(out, input);
        assert!(q.is_empty());
    }

    #[test]
    fn interleaved_pushes_and_pops_stay_fifo() {
        let input = filled(3 * BLOCK_LEN / 2);
        let mut q = ChunkedQueue::new();
        let mut out = Vec::with_capacity(input.len());
        let mut chunk = vec![0u32; 70_001];

        let mut fed = 0;
        while fed < input.len() || !q.is_empty() {
            if fed < input.len() {
                let n = 48_271.min(input.len() - fed);
                q.push_back(&input[fed..fed + n]);
                fed += n;
            }
            let got = q.pop_front(&mut chunk);
            out.extend_from_slice(&chunk[..got]);
            assert_eq!(q.len(), fed - out.len());
        }
        assert_eq!(out, input);
    }

    #[test]
    fn random_access_matches_contents() {
        let input = filled(BLOCK_LEN + 7);
        let mut q = ChunkedQueue::new();
        q.push_back(&input);
        for &i in &[0usize, 1, BLOCK_LEN - 1, BLOCK_LEN, BLOCK_LEN + 6] {
            assert_eq!(q[i], input[i]);
        }
        assert_eq!(q.iter().count(), input.len());
        assert!(q.iter().eq(input.iter().copied()));
    }

    #[test]
    #[should_panic(expected = "queue index out of bounds")]
    fn out_of_bounds_read_panics() {
        let mut q = ChunkedQueue::new();
        q.push_back(&[1u32, 2, 3]);
        let _ = q[3];
    }

    #[test]
    fn pop_past_the_end_returns_what_is_there() {
        // Fill exactly one block, then ask for one element more.
        let input = filled(BLOCK_LEN);
        let mut q = ChunkedQueue::new();
        q.push_back(&input);
        let mut out = vec![0u32; BLOCK_LEN + 1];
        assert_eq!(q.pop_front(&mut out), BLOCK_LEN);
        assert_eq!(q.len(), 0);
        assert_eq!(&out[..BLOCK_LEN], &input[..]);
    }

    #[test]
    fn pop_front_into_another_queue() {
        let input = filled(BLOCK_LEN + 999);
        let mut a = ChunkedQueue::new();
        a.push_back(&input);
        let mut b = ChunkedQueue::new();
        b.push_back(&[7u32; 3]);

        let moved = a.pop_front_into(&mut b, BLOCK_LEN + 10);
        assert_eq!(moved, BLOCK_LEN + 10);
        assert_eq!(a.len(), 989);
        assert_eq!(b.len(), 3 + BLOCK_LEN + 10);
        assert!(b.range(3, b.len()).eq(input[..BLOCK_LEN + 10].iter().copied()));

        // Asking for more than remains moves only the remainder.
        let moved = a.pop_front_into(&mut b, BLOCK_LEN);
        assert_eq!(moved, 989);
        assert!(a.is_empty());
    }

    #[test]
    fn clear_releases_everything() {
        let mut q = ChunkedQueue::new();
        q.push_back(&filled(2 * BLOCK_LEN));
        q.clear();
        assert_eq!(q.len(), 0);
        let mut out = vec![0u32; 8];
        assert_eq!(q.pop_front(&mut out), 0);
    }

    #[test]
    fn dump_then_load_round_trips() {
        let input = filled(BLOCK_LEN + 4321);
        let mut q = ChunkedQueue::new();
        q.push_back(&input);
        // Pop a prefix so the dump has to skip consumed elements.
        let mut head = vec![0u32; 17];
        q.pop_front(&mut head);

        let mut bytes = Vec::new();
        q.dump(&mut bytes).unwrap();

        let mut back: ChunkedQueue<u32> = ChunkedQueue::new();
        back.load(&mut bytes.as_slice()).unwrap();
        assert_eq!(back.len(), q.len());
        assert!(back.iter().eq(input[17..].iter().copied()));
    }

    #[test]
    #[should_panic(expected = "non-empty queue")]
    fn load_into_non_empty_queue_panics() {
        let mut q = ChunkedQueue::new();
        q.push_back(&[1u32]);
        let mut bytes = Vec::new();
        q.dump(&mut bytes).unwrap();
        q.load(&mut bytes.as_slice()).unwrap();
    }
}
