//! Insert-then-merge sharded index.
//!
//! Appended tuples accumulate in staging buffers; [`DynamicIndex::merge`]
//! redistributes them across `2^N` shards keyed by the low key bits.
//! Within a shard, postings live in a tiered vector ordered by subkey, so
//! merging is a stable sort of the new pairs, an exclusive scan of the
//! per-subkey deltas, and one positional insert per posting. Shards are
//! independent, so the merge runs shard-parallel.

use std::io::{Read, Write};

use fxhash::FxHashMap;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::index::{
    make_posting, resolve_votes, vote_postings, RefIndex, MAX_REFS, MAX_REF_POS, VOTES,
};
use crate::io::LeField;
use crate::kmer::{kmers_par, kmers_rolling};
use crate::tiered::{TieredIter, TieredVec};

/// Reference name registry: id plus the position where the next chunk of
/// that reference continues.
#[derive(Default)]
struct HeaderRegistry {
    names: Vec<String>,
    map: FxHashMap<String, (u32, u64)>,
}

impl HeaderRegistry {
    fn get_or_insert(&mut self, name: &str) -> (u32, u64) {
        if let Some(&(id, offset)) = self.map.get(name) {
            assert!(
                offset != u64::MAX,
                "cannot extend a reference loaded from disk"
            );
            (id, offset)
        } else {
            let id = self.names.len() as u32;
            assert!((id as usize) < MAX_REFS, "reference id space exhausted");
            self.map.insert(name.to_string(), (id, 0));
            self.names.push(name.to_string());
            (id, 0)
        }
    }

    fn advance(&mut self, name: &str, by: u64) {
        self.map.get_mut(name).unwrap().1 += by;
    }
}

struct Shard {
    /// Subkey start offsets into `values`, `n_keys_per_shard + 1` entries.
    offsets: Vec<u64>,
    values: TieredVec<u64>,
}

impl Shard {
    fn new(n_subkeys: usize) -> Self {
        Shard {
            offsets: vec![0; n_subkeys + 1],
            values: TieredVec::new(),
        }
    }

    /// Fold a batch of `(subkey, posting)` pairs into the shard.
    fn absorb(&mut self, mut pairs: Vec<(u32, u64)>) {
        if pairs.is_empty() {
            return;
        }
        pairs.sort_by_key(|p| p.0);

        let mut delta = vec![0u64; self.offsets.len()];
        let mut inserted_before = 0u64;
        let mut i = 0;
        while i < pairs.len() {
            let subkey = pairs[i].0 as usize;
            let run_end = pairs[i..]
                .iter()
                .position(|p| p.0 as usize != subkey)
                .map_or(pairs.len(), |n| i + n);
            // New postings of this subkey go after its existing list,
            // shifted by everything inserted for smaller subkeys.
            let base = (self.offsets[subkey + 1] + inserted_before) as usize;
            for (j, &(_, posting)) in pairs[i..run_end].iter().enumerate() {
                self.values.insert(base + j, posting);
            }
            delta[subkey] = (run_end - i) as u64;
            inserted_before += (run_end - i) as u64;
            i = run_end;
        }

        // Exclusive scan of the deltas advances every boundary in place.
        let mut acc = 0u64;
        for (slot, d) in self.offsets.iter_mut().zip(delta.iter()) {
            *slot += acc;
            acc += d;
        }
    }
}

pub struct DynamicIndex {
    cfg: IndexConfig,
    n_shards: usize,
    stage_keys: Vec<u32>,
    stage_values: Vec<u64>,
    registry: HeaderRegistry,
    shards: Vec<Shard>,
}

impl DynamicIndex {
    pub fn new(cfg: IndexConfig) -> Self {
        assert!(cfg.n_shard_bits < 32, "shard bits out of range");
        let n_shards = 1usize << cfg.n_shard_bits;
        let n_subkeys = (cfg.n_keys() >> cfg.n_shard_bits) as usize;
        let shards = (0..n_shards).map(|_| Shard::new(n_subkeys)).collect();
        DynamicIndex {
            cfg,
            n_shards,
            stage_keys: Vec::new(),
            stage_values: Vec::new(),
            registry: HeaderRegistry::default(),
            shards,
        }
    }

    /// Tuples staged since the last merge; invisible to `search` until
    /// merged.
    pub fn staged(&self) -> usize {
        self.stage_keys.len()
    }

    pub(crate) fn config_mut(&mut self) -> &mut IndexConfig {
        &mut self.cfg
    }

    /// Redistribute the staging buffers across the shards.
    pub fn merge(&mut self) {
        if self.stage_keys.is_empty() {
            return;
        }
        info!(tuples = self.stage_keys.len(), shards = self.n_shards, "merging staged postings");
        let keys = std::mem::take(&mut self.stage_keys);
        let values = std::mem::take(&mut self.stage_values);

        let mask = (self.n_shards - 1) as u32;
        let shard_bits = self.cfg.n_shard_bits;
        let mut buckets: Vec<Vec<(u32, u64)>> = (0..self.n_shards).map(|_| Vec::new()).collect();
        for (&key, &value) in keys.iter().zip(values.iter()) {
            buckets[(key & mask) as usize].push((key >> shard_bits, value));
        }

        self.shards
            .par_iter_mut()
            .zip(buckets.into_par_iter())
            .progress_count(self.n_shards as u64)
            .for_each(|(shard, bucket)| shard.absorb(bucket));
        debug!("merge complete");
    }

    fn postings(&self, key: u32) -> TieredIter<'_, u64> {
        let shard = &self.shards[(key as usize) & (self.n_shards - 1)];
        let subkey = (key >> self.cfg.n_shard_bits) as usize;
        shard
            .values
            .range(shard.offsets[subkey] as usize, shard.offsets[subkey + 1] as usize)
    }

    pub(crate) fn dump_body<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        assert!(self.stage_keys.is_empty(), "dumping with unmerged postings");
        crate::io::write_str_table(w, &self.registry.names)?;

        // Per-shard key tables: subkeys with a non-empty list, each packed
        // with its shard-local offset and count.
        let mut shard_offsets = Vec::with_capacity(self.n_shards + 1);
        let mut keys: Vec<u32> = Vec::new();
        let mut packed: Vec<u64> = Vec::new();
        shard_offsets.push(0u32);
        for shard in &self.shards {
            for subkey in 0..shard.offsets.len() - 1 {
                let start = shard.offsets[subkey];
                let count = shard.offsets[subkey + 1] - start;
                if count > 0 {
                    assert!(start < (1u64 << 32) && count < (1u64 << 32));
                    keys.push(subkey as u32);
                    packed.push((start << 32) | count);
                }
            }
            shard_offsets.push(keys.len() as u32);
        }

        (keys.len() as u32).write_le(w)?;
        crate::io::write_slice(w, &shard_offsets)?;
        crate::io::write_slice(w, &keys)?;
        crate::io::write_slice(w, &packed)?;
        for shard in &self.shards {
            (shard.values.len() as u64).write_le(w)?;
            for v in shard.values.iter() {
                v.write_le(w)?;
            }
        }
        0u32.write_le(w)?; // max_occ, not tracked by the dynamic shape
        Ok(())
    }

    pub(crate) fn load_body<R: Read>(r: &mut R, cfg: IndexConfig) -> std::io::Result<Self> {
        let names = crate::io::read_str_table(r)?;
        let mut index = DynamicIndex::new(cfg);
        for (id, name) in names.iter().enumerate() {
            // Loaded references can be queried but not extended; the
            // sentinel offset makes that explicit.
            index.registry.map.insert(name.clone(), (id as u32, u64::MAX));
        }
        index.registry.names = names;

        let n_unique = u32::read_le(r)? as usize;
        let shard_offsets: Vec<u32> = crate::io::read_vec(r, index.n_shards + 1)?;
        let keys: Vec<u32> = crate::io::read_vec(r, n_unique)?;
        let packed: Vec<u64> = crate::io::read_vec(r, n_unique)?;

        for s in 0..index.n_shards {
            let shard = &mut index.shards[s];
            let from = shard_offsets[s] as usize;
            let to = shard_offsets[s + 1] as usize;
            let mut acc = 0u64;
            let mut entry = from;
            for subkey in 0..shard.offsets.len() - 1 {
                shard.offsets[subkey] = acc;
                if entry < to && keys[entry] as usize == subkey {
                    let start = packed[entry] >> 32;
                    let count = packed[entry] & 0xffff_ffff;
                    assert_eq!(start, acc, "shard offsets are inconsistent");
                    acc += count;
                    entry += 1;
                }
            }
            assert_eq!(entry, to);
            *shard.offsets.last_mut().unwrap() = acc;
        }
        for s in 0..index.n_shards {
            let n = u64::read_le(r)? as usize;
            assert_eq!(
                n as u64,
                *index.shards[s].offsets.last().unwrap(),
                "shard value count disagrees with its offsets"
            );
            let values: Vec<u64> = crate::io::read_vec(r, n)?;
            index.shards[s].values = TieredVec::from_values(values);
        }
        let _max_occ = u32::read_le(r)?;
        Ok(index)
    }

    /// Convenience used by tests and callers that want raw postings.
    pub fn list(&self, key: u32) -> impl Iterator<Item = u64> + '_ {
        self.postings(key)
    }
}

impl RefIndex for DynamicIndex {
    fn params(&self) -> &IndexConfig {
        &self.cfg
    }

    fn headers(&self) -> &[String] {
        &self.registry.names
    }

    fn max_occ(&self) -> u32 {
        0
    }

    fn init_query_buffers(&self) {
        VOTES.with(|v| v.borrow_mut().reset());
    }

    fn add_record(&mut self, name: String, seq: &[u8]) {
        let (id, offset) = self.registry.get_or_insert(&name);
        assert!(offset + (seq.len() as u64) < MAX_REF_POS, "reference too long");

        let kmers = kmers_par(seq, self.cfg.k as usize, self.cfg.sigma, self.cfg.encoder());
        self.stage_keys.extend_from_slice(&kmers);
        self.stage_values
            .extend((0..kmers.len() as u64).map(|i| make_posting(id, offset + i)));
        // The next chunk of this reference continues after this sequence.
        self.registry.advance(&name, seq.len() as u64);
    }

    fn build(&mut self) {
        self.merge();
    }

    fn search_oriented(&self, seq: &[u8]) -> Option<(u32, u64, f32)> {
        let keys = kmers_rolling(seq, self.cfg.k as usize, self.cfg.sigma, self.cfg.encoder());
        if keys.is_empty() {
            return None;
        }
        VOTES.with(|votes| {
            let votes = &mut *votes.borrow_mut();
            votes.reset();
            vote_postings(&keys, self.cfg.bandwidth, |key| self.postings(key), votes);
            resolve_votes(votes, keys.len(), self.cfg.presence_fraction, self.cfg.bandwidth)
        })
    }
}
