//! Out-of-core sort-merge over paired key/value queues.
//!
//! Everything here works on a caller-supplied scratch of `M` keys and `M`
//! values, where `M` is the partition size (at least one pool block). The
//! sort generates sorted runs of `M` pairs, then merges runs pairwise until
//! one remains; merge steps are planned so each step's load fits in the
//! scratch. Intermediate memory stays bounded by the scratch plus one
//! in-flight output partition.
//!
//! Contract violations (length mismatches, non-empty outputs, short pops)
//! are bugs and abort via `assert!`.

use std::collections::VecDeque;

use itertools::Itertools;
use rayon::prelude::*;
use tracing::debug;

use crate::cqueue::ChunkedQueue;
use crate::pool::PoolItem;

/// Scratch buffer for the sort: `M` keys followed by `M` values.
pub struct SortScratch<K, V> {
    pub keys: Vec<K>,
    pub vals: Vec<V>,
}

impl<K: Default + Clone, V: Default + Clone> SortScratch<K, V> {
    pub fn new(m: usize) -> Self {
        assert!(m >= 2, "partition size too small");
        SortScratch {
            keys: vec![K::default(); m],
            vals: vec![V::default(); m],
        }
    }

    #[inline]
    pub fn partition_size(&self) -> usize {
        self.keys.len()
    }
}

/// Largest index in sorted `queue[start..end]` where `key` could be
/// inserted without breaking the order.
pub fn cq_upper_bound<K>(queue: &ChunkedQueue<K>, mut start: usize, mut end: usize, key: K) -> usize
where
    K: PoolItem + Ord,
{
    assert!(queue.len() >= end);
    while start < end {
        let mid = (start + end) / 2;
        if key < queue[mid] {
            end = mid;
        } else {
            start = mid + 1;
        }
    }
    start
}

/// Smallest index in sorted `queue[start..end]` where `key` could be
/// inserted without breaking the order.
pub fn cq_lower_bound<K>(queue: &ChunkedQueue<K>, mut start: usize, mut end: usize, key: K) -> usize
where
    K: PoolItem + Ord,
{
    assert!(queue.len() >= end);
    while start < end {
        let mid = (start + end) / 2;
        if key > queue[mid] {
            start = mid + 1;
        } else {
            end = mid;
        }
    }
    start
}

/// Split a sorted queue into runs of at most `m` elements such that all
/// duplicates of a key land in the same run: each window is shrunk back to
/// the first occurrence of its last key.
pub fn cq_get_partitions<K>(keys: &ChunkedQueue<K>, m: usize) -> Vec<usize>
where
    K: PoolItem + Ord,
{
    let n = keys.len();
    let mut sizes = Vec::new();
    let mut off = 0;
    while off < n {
        if n - off <= m {
            sizes.push(n - off);
            break;
        }
        let mut np = m;
        let key = keys[off + np - 1];
        np = cq_lower_bound(keys, off, off + np, key) - off;
        assert!(np > 0, "a single key run exceeds the partition size");
        sizes.push(np);
        off += np;
    }
    sizes
}

/// Plan a merge of two sorted queues into steps of at most `m` elements.
/// Degenerate steps where one side is entirely smaller move that side
/// without touching the scratch.
pub fn cq_get_merge_partitions<K>(
    keys_a: &ChunkedQueue<K>,
    keys_b: &ChunkedQueue<K>,
    m: usize,
) -> Vec<(usize, usize)>
where
    K: PoolItem + Ord,
{
    let (na, nb) = (keys_a.len(), keys_b.len());
    let mut steps = Vec::new();
    let (mut off_a, mut off_b) = (0, 0);

    while off_a < na && off_b < nb {
        let mut npa = (na - off_a).min(m / 2);
        let mut npb = (nb - off_b).min(m / 2);

        if npa < m / 2 && npb < m / 2 {
            steps.push((npa, npb));
            off_a += npa;
            off_b += npb;
            break;
        }

        if keys_a[off_a + npa - 1] <= keys_b[off_b] {
            // All of A's window precedes B.
            steps.push((npa, 0));
            off_a += npa;
        } else if keys_b[off_b + npb - 1] <= keys_a[off_a] {
            // All of B's window precedes A.
            steps.push((0, npb));
            off_b += npb;
        } else {
            // Overlap: shrink the side that reaches further.
            if keys_a[off_a + npa - 1] < keys_b[off_b + npb - 1] {
                npb = cq_upper_bound(keys_b, off_b, off_b + npb, keys_a[off_a + npa - 1]) - off_b;
            } else if keys_b[off_b + npb - 1] < keys_a[off_a + npa - 1] {
                npa = cq_upper_bound(keys_a, off_a, off_a + npa, keys_b[off_b + npb - 1]) - off_a;
            }
            steps.push((npa, npb));
            off_a += npa;
            off_b += npb;
        }
    }

    if off_a == na && off_b < nb {
        steps.push((0, nb - off_b));
    } else if off_b == nb && off_a < na {
        steps.push((na - off_a, 0));
    }
    steps
}

/// Stable in-memory sort of `vals` by `keys`, both reordered in place.
fn sort_pairs<K, V>(keys: &mut [K], vals: &mut [V])
where
    K: Ord + Copy + Send + Sync,
    V: Copy + Send + Sync,
{
    debug_assert_eq!(keys.len(), vals.len());
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.par_sort_by_key(|&i| keys[i]);
    let sorted_keys: Vec<K> = order.par_iter().map(|&i| keys[i]).collect();
    let sorted_vals: Vec<V> = order.par_iter().map(|&i| vals[i]).collect();
    keys.copy_from_slice(&sorted_keys);
    vals.copy_from_slice(&sorted_vals);
}

fn cq_merge_by_key<K, V>(
    mut keys_a: ChunkedQueue<K>,
    mut vals_a: ChunkedQueue<V>,
    mut keys_b: ChunkedQueue<K>,
    mut vals_b: ChunkedQueue<V>,
    scratch: &mut SortScratch<K, V>,
    keys_out: &mut ChunkedQueue<K>,
    vals_out: &mut ChunkedQueue<V>,
) where
    K: PoolItem + Ord,
    V: PoolItem,
{
    assert_eq!(keys_a.len(), vals_a.len());
    assert_eq!(keys_b.len(), vals_b.len());
    assert!(keys_out.is_empty() && vals_out.is_empty());

    let m = scratch.partition_size();
    for (na, nb) in cq_get_merge_partitions(&keys_a, &keys_b, m) {
        if na > 0 && nb > 0 {
            assert_eq!(keys_a.pop_front(&mut scratch.keys[..na]), na);
            assert_eq!(keys_b.pop_front(&mut scratch.keys[na..na + nb]), nb);
            assert_eq!(vals_a.pop_front(&mut scratch.vals[..na]), na);
            assert_eq!(vals_b.pop_front(&mut scratch.vals[na..na + nb]), nb);
            // Both loads are individually sorted, so a stable sort of the
            // concatenation is the merge.
            sort_pairs(&mut scratch.keys[..na + nb], &mut scratch.vals[..na + nb]);
            keys_out.push_back(&scratch.keys[..na + nb]);
            vals_out.push_back(&scratch.vals[..na + nb]);
        } else if na > 0 {
            assert_eq!(keys_a.pop_front_into(keys_out, na), na);
            assert_eq!(vals_a.pop_front_into(vals_out, na), na);
        } else {
            assert_eq!(keys_b.pop_front_into(keys_out, nb), nb);
            assert_eq!(vals_b.pop_front_into(vals_out, nb), nb);
        }
    }
}

/// Sort `keys` ascending and permute `values` identically, stable for
/// equal keys. Both queues are rewritten in place; peak extra memory is
/// the scratch plus one in-flight merge output.
pub fn cq_sort_by_key<K, V>(
    keys: &mut ChunkedQueue<K>,
    values: &mut ChunkedQueue<V>,
    scratch: &mut SortScratch<K, V>,
) where
    K: PoolItem + Ord,
    V: PoolItem,
{
    let n = keys.len();
    assert_eq!(n, values.len(), "key/value queues differ in length");
    let m = scratch.partition_size();

    if n <= m {
        let nk = keys.pop_front(&mut scratch.keys[..n]);
        let nv = values.pop_front(&mut scratch.vals[..n]);
        assert_eq!(nk, n);
        assert_eq!(nv, n);
        sort_pairs(&mut scratch.keys[..n], &mut scratch.vals[..n]);
        assert!(keys.is_empty() && values.is_empty());
        keys.push_back(&scratch.keys[..n]);
        values.push_back(&scratch.vals[..n]);
        return;
    }

    // Run generation: sorted loads of up to M pairs each.
    let mut runs: VecDeque<(ChunkedQueue<K>, ChunkedQueue<V>)> = VecDeque::new();
    loop {
        let nk = keys.pop_front(&mut scratch.keys[..m]);
        let nv = values.pop_front(&mut scratch.vals[..m]);
        assert_eq!(nk, nv);
        if nk == 0 {
            break;
        }
        sort_pairs(&mut scratch.keys[..nk], &mut scratch.vals[..nk]);
        let mut run_keys = ChunkedQueue::new();
        let mut run_vals = ChunkedQueue::new();
        run_keys.push_back(&scratch.keys[..nk]);
        run_vals.push_back(&scratch.vals[..nk]);
        runs.push_back((run_keys, run_vals));
    }
    debug!(runs = runs.len(), "generated sorted runs");
    assert!(keys.is_empty() && values.is_empty());

    // Pairwise merging; the final merge lands back in the input queues.
    let mut round = 1;
    while runs.len() > 2 {
        let (ka, va) = runs.pop_front().unwrap();
        let (kb, vb) = runs.pop_front().unwrap();
        debug!(round, left = ka.len(), right = kb.len(), "merge");
        round += 1;
        let mut keys_out = ChunkedQueue::new();
        let mut vals_out = ChunkedQueue::new();
        cq_merge_by_key(ka, va, kb, vb, scratch, &mut keys_out, &mut vals_out);
        runs.push_back((keys_out, vals_out));
    }
    let (ka, va) = runs.pop_front().unwrap();
    let (kb, vb) = runs.pop_front().unwrap();
    debug!(round, left = ka.len(), right = kb.len(), "final merge");
    cq_merge_by_key(ka, va, kb, vb, scratch, keys, values);
    assert_eq!(keys.len(), n);
    assert_eq!(values.len(), n);
}

/// Consume a sorted `keys` queue and emit its distinct keys (strictly
/// ascending) and their multiplicities. `stage` must hold at least one
/// partition.
pub fn cq_count_unique<K>(
    keys: &mut ChunkedQueue<K>,
    m: usize,
    stage: &mut [K],
    unique_keys: &mut ChunkedQueue<K>,
    counts: &mut ChunkedQueue<u32>,
) where
    K: PoolItem + Ord,
{
    let total = keys.len();
    let partitions = cq_get_partitions(keys, m);
    assert_eq!(partitions.iter().sum::<usize>(), total);

    let mut run_keys: Vec<K> = Vec::new();
    let mut run_counts: Vec<u32> = Vec::new();
    for np in partitions {
        assert!(np <= stage.len());
        assert_eq!(keys.pop_front(&mut stage[..np]), np);
        let slice = &mut stage[..np];
        // Partitions of a sorted queue arrive sorted; histogram by run
        // length after re-establishing the order defensively in debug.
        debug_assert!(slice.windows(2).all(|w| w[0] <= w[1]));
        run_keys.clear();
        run_counts.clear();
        for (count, key) in slice.iter().copied().dedup_with_count() {
            run_keys.push(key);
            run_counts.push(count as u32);
        }
        unique_keys.push_back(&run_keys);
        counts.push_back(&run_counts);
    }
    assert!(keys.is_empty());
}
