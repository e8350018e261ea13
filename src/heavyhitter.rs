//! Frequency counter that tracks the current maximum without sorting.

use std::hash::Hash;

use fxhash::FxHashMap;

/// Per-worker vote counter. Workers own their counter exclusively, so
/// there is no synchronization; `reset` recycles the allocation between
/// queries.
#[derive(Default)]
pub struct HeavyHitter<T> {
    counts: FxHashMap<T, u32>,
    top: Option<(T, u32)>,
}

impl<T: Eq + Hash + Copy> HeavyHitter<T> {
    /// Count one vote for `key`; the cached top moves only on a strictly
    /// greater count, so the earliest key to reach a count keeps the lead.
    #[inline]
    pub fn insert(&mut self, key: T) {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        match self.top {
            Some((_, top_count)) if *count <= top_count => {}
            _ => self.top = Some((key, *count)),
        }
    }

    #[inline]
    pub fn top(&self) -> Option<(T, u32)> {
        self.top
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.top = None;
    }
}
