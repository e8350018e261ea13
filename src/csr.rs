//! Offsets-plus-values posting store shared by the static index shapes.
//!
//! The posting list for key `k` is the contiguous run
//! `values[offsets[k] .. offsets[k + 1]]`. Values stay in the chunked
//! queue that the build pipeline sorted, read through its O(1) indexing;
//! the compressed form swaps in Elias-coded arrays and is queried through
//! the same iterator interface without decompressing.

use std::io::{Read, Result, Write};
use std::mem;

use crate::compress::{DeltaVec, GammaCursor, GammaVec};
use crate::cqueue::{ChunkedQueue, QueueIter};
use crate::io::LeField;
use crate::pool::PoolItem;

/// Width of the stored posting values. Coordinate indexes store packed
/// 64-bit postings, the fragment index stores 32-bit fragment ids.
pub trait PostingValue: PoolItem + LeField + Ord {
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

impl PostingValue for u32 {
    #[inline]
    fn to_u64(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u32
    }
}

impl PostingValue for u64 {
    #[inline]
    fn to_u64(self) -> u64 {
        self
    }
    #[inline]
    fn from_u64(v: u64) -> Self {
        v
    }
}

enum Offsets {
    Plain(Vec<u64>),
    Coded(DeltaVec),
}

enum Values<V: PoolItem> {
    Plain(ChunkedQueue<V>),
    Coded(GammaVec),
}

pub struct Csr<V: PostingValue> {
    offsets: Offsets,
    values: Values<V>,
}

impl<V: PostingValue> Csr<V> {
    /// Wrap the consolidated build output: a scanned offsets array with
    /// `n_keys + 1` entries and the value queue it indexes into.
    pub fn from_parts(offsets: Vec<u64>, values: ChunkedQueue<V>) -> Self {
        assert!(!offsets.is_empty());
        assert_eq!(*offsets.last().unwrap(), values.len() as u64);
        debug_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        Csr {
            offsets: Offsets::Plain(offsets),
            values: Values::Plain(values),
        }
    }

    pub fn n_keys(&self) -> usize {
        match &self.offsets {
            Offsets::Plain(o) => o.len() - 1,
            Offsets::Coded(o) => o.len() as usize - 1,
        }
    }

    pub fn n_values(&self) -> u64 {
        self.offset_at(self.n_keys())
    }

    #[inline]
    fn offset_at(&self, i: usize) -> u64 {
        match &self.offsets {
            Offsets::Plain(o) => o[i],
            Offsets::Coded(o) => o.get(i as u64),
        }
    }

    /// Iterate the posting list of `key`, widened to `u64`.
    pub fn list(&self, key: u32) -> PostingIter<'_, V> {
        let start = self.offset_at(key as usize);
        let end = self.offset_at(key as usize + 1);
        match &self.values {
            Values::Plain(q) => PostingIter::Plain(q.range(start as usize, end as usize)),
            Values::Coded(g) => PostingIter::Coded(g.cursor(start), end - start),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.values, Values::Coded(_))
    }

    /// Re-encode both arrays in place with Elias codes.
    pub fn compress(&mut self) {
        if matches!(self.offsets, Offsets::Plain(_)) {
            let old = mem::replace(&mut self.offsets, Offsets::Plain(Vec::new()));
            let Offsets::Plain(offs) = old else { unreachable!() };
            self.offsets = Offsets::Coded(DeltaVec::from_values(offs));
        }
        if matches!(self.values, Values::Plain(_)) {
            let old = mem::replace(&mut self.values, Values::Plain(ChunkedQueue::new()));
            let Values::Plain(queue) = old else { unreachable!() };
            self.values = Values::Coded(GammaVec::from_values(queue.iter().map(V::to_u64)));
        }
    }

    pub fn dump<W: Write>(&self, w: &mut W) -> Result<()> {
        match (&self.offsets, &self.values) {
            (Offsets::Plain(offsets), Values::Plain(values)) => {
                (offsets.len() as u64).write_le(w)?;
                crate::io::write_slice(w, offsets)?;
                values.dump(w)?;
            }
            (Offsets::Coded(offsets), Values::Coded(values)) => {
                offsets.write_to(w)?;
                values.write_to(w)?;
            }
            _ => unreachable!("offsets and values are always encoded together"),
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, compressed: bool) -> Result<Self> {
        if compressed {
            let offsets = DeltaVec::read_from(r)?;
            let values = GammaVec::read_from(r)?;
            Ok(Csr {
                offsets: Offsets::Coded(offsets),
                values: Values::Coded(values),
            })
        } else {
            let n = u64::read_le(r)? as usize;
            let offsets: Vec<u64> = crate::io::read_vec(r, n)?;
            let mut values = ChunkedQueue::new();
            values.load(r)?;
            Ok(Csr {
                offsets: Offsets::Plain(offsets),
                values: Values::Plain(values),
            })
        }
    }
}

pub enum PostingIter<'a, V: PostingValue> {
    Plain(QueueIter<'a, V>),
    Coded(GammaCursor<'a>, u64),
}

impl<V: PostingValue> Iterator for PostingIter<'_, V> {
    type Item = u64;

    #[inline]
    fn next(&mut self) -> Option<u64> {
        match self {
            PostingIter::Plain(it) => it.next().map(V::to_u64),
            PostingIter::Coded(cursor, remaining) => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                cursor.next()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Csr<u32> {
        // Keys 0..4 with lists [], [10, 11], [], [12].
        let offsets = vec![0u64, 0, 2, 2, 3];
        let mut values = ChunkedQueue::new();
        values.push_back(&[10u32, 11, 12]);
        Csr::from_parts(offsets, values)
    }

    #[test]
    fn lists_are_contiguous_slices() {
        let csr = sample();
        assert_eq!(csr.n_keys(), 4);
        assert_eq!(csr.n_values(), 3);
        assert_eq!(csr.list(0).count(), 0);
        assert_eq!(csr.list(1).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(csr.list(2).count(), 0);
        assert_eq!(csr.list(3).collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn compressed_view_reads_identically() {
        let mut csr = sample();
        csr.compress();
        assert!(csr.is_compressed());
        assert_eq!(csr.list(1).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(csr.list(3).collect::<Vec<_>>(), vec![12]);
        assert_eq!(csr.list(0).count(), 0);
    }

    #[test]
    fn both_layouts_round_trip_through_bytes() {
        let csr = sample();
        let mut bytes = Vec::new();
        csr.dump(&mut bytes).unwrap();
        let back: Csr<u32> = Csr::load(&mut bytes.as_slice(), false).unwrap();
        assert_eq!(back.list(1).collect::<Vec<_>>(), vec![10, 11]);

        let mut coded = sample();
        coded.compress();
        let mut bytes = Vec::new();
        coded.dump(&mut bytes).unwrap();
        let back: Csr<u32> = Csr::load(&mut bytes.as_slice(), true).unwrap();
        assert_eq!(back.list(1).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(back.list(3).collect::<Vec<_>>(), vec![12]);
    }
}
