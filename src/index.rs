//! The coordinate index and the capability set shared by all index shapes.
//!
//! A posting packs a reference id and position into 64 bits; at query time
//! postings vote in "intercept" space, `(ref_pos - qry_pos) / bandwidth`,
//! so collinear k-mer hits pile onto the same bin. The heaviest bin wins
//! if enough of the query's k-mers support it.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{IndexConfig, SIGMA_QSIG};
use crate::cqueue::ChunkedQueue;
use crate::csr::Csr;
use crate::dynamic::DynamicIndex;
use crate::error::{Error, Result};
use crate::extsort::{cq_get_partitions, cq_sort_by_key, SortScratch};
use crate::heavyhitter::HeavyHitter;
use crate::io::LeField;
use crate::jaccard::JaccardIndex;
use crate::kmer::{kmers_par, kmers_rolling, revcomp};
use crate::pool::PoolItem;

/// High bits of a posting hold the reference id, low bits the position.
pub const REF_ID_BITS: u32 = 20;
pub const REF_POS_BITS: u32 = 64 - REF_ID_BITS;
pub const MAX_REFS: usize = 1 << REF_ID_BITS;
pub const MAX_REF_POS: u64 = 1 << REF_POS_BITS;
const REF_POS_MASK: u64 = MAX_REF_POS - 1;

#[inline]
pub fn make_posting(ref_id: u32, pos: u64) -> u64 {
    debug_assert!((ref_id as usize) < MAX_REFS);
    debug_assert!(pos < MAX_REF_POS);
    ((ref_id as u64) << REF_POS_BITS) | pos
}

#[inline]
pub fn posting_ref(v: u64) -> u32 {
    (v >> REF_POS_BITS) as u32
}

#[inline]
pub fn posting_pos(v: u64) -> u64 {
    v & REF_POS_MASK
}

/// One query's result. `ref_name` is `None` for the unmapped sentinel,
/// printed as `*` with strand `+`, position 0 and presence 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment<'a> {
    pub ref_name: Option<&'a str>,
    pub forward: bool,
    pub position: u64,
    pub presence: f32,
}

impl Alignment<'_> {
    pub fn unmapped() -> Self {
        Alignment {
            ref_name: None,
            forward: true,
            position: 0,
            presence: 0.0,
        }
    }
}

fn resolve_alignment<'a>(
    headers: &'a [String],
    hit: Option<(u32, u64, f32)>,
    forward: bool,
) -> Alignment<'a> {
    match hit {
        Some((id, position, presence)) => Alignment {
            ref_name: Some(headers[id as usize].as_str()),
            forward,
            position,
            presence,
        },
        None => Alignment::unmapped(),
    }
}

/// Capability set shared by the coordinate, Jaccard and dynamic shapes.
/// The orientation logic lives in the provided methods; shapes implement
/// the single-strand primitives.
pub trait RefIndex {
    fn params(&self) -> &IndexConfig;
    fn headers(&self) -> &[String];
    /// 99th-percentile posting-list length, advisory only.
    fn max_occ(&self) -> u32;
    /// Clear any per-worker query state left over from a previous session.
    fn init_query_buffers(&self);
    /// Register one oriented sequence under `name`.
    fn add_record(&mut self, name: String, seq: &[u8]);
    /// Consume everything added so far into the queryable form.
    fn build(&mut self);
    /// Search one strand; `None` stands for presence 0.
    fn search_oriented(&self, seq: &[u8]) -> Option<(u32, u64, f32)>;

    /// Add a reference. With both strands indexed the record lands twice,
    /// suffixed `+` and `-`, under consecutive ids.
    fn add(&mut self, name: &str, seq: &[u8]) {
        if self.params().fwd_rev {
            self.add_record(format!("{name}+"), seq);
            self.add_record(format!("{name}-"), &revcomp(seq));
        } else {
            self.add_record(name.to_string(), seq);
        }
    }

    /// Search both orientations as needed. Queries not longer than `2k`
    /// are unmapped without a lookup; the forward pass wins presence ties.
    fn search(&self, seq: &[u8]) -> Alignment<'_> {
        let params = self.params();
        if seq.len() <= 2 * params.k as usize {
            return Alignment::unmapped();
        }
        let fwd = self.search_oriented(seq);
        if params.fwd_rev || params.sigma == SIGMA_QSIG {
            // Both strands are in the index, or the alphabet has no
            // complement; one pass is enough.
            return resolve_alignment(self.headers(), fwd, true);
        }
        let rev = self.search_oriented(&revcomp(seq));
        let fwd_presence = fwd.map_or(0.0, |h| h.2);
        let rev_presence = rev.map_or(0.0, |h| h.2);
        if fwd_presence >= rev_presence {
            resolve_alignment(self.headers(), fwd, true)
        } else {
            resolve_alignment(self.headers(), rev, false)
        }
    }
}

thread_local! {
    /// Intercept vote counters, one per worker thread.
    pub(crate) static VOTES: RefCell<HeavyHitter<u64>> = RefCell::new(HeavyHitter::default());
}

/// Project every posting of every query k-mer into banded intercept space
/// and vote. A posting near the lower edge of its band also votes for the
/// previous band, which absorbs off-by-one band assignments.
pub(crate) fn vote_postings<I>(
    query_kmers: &[u32],
    bandwidth: u32,
    mut postings_of: impl FnMut(u32) -> I,
    votes: &mut HeavyHitter<u64>,
) where
    I: Iterator<Item = u64>,
{
    let bandwidth = bandwidth as u64;
    for (j, &key) in query_kmers.iter().enumerate() {
        for v in postings_of(key) {
            let ref_id = posting_ref(v);
            let ref_pos = posting_pos(v);
            let mut intercept = ref_pos.saturating_sub(j as u64) / bandwidth;
            votes.insert(make_posting(ref_id, intercept));
            if intercept >= bandwidth {
                intercept -= bandwidth;
                votes.insert(make_posting(ref_id, intercept));
            }
        }
    }
}

/// Turn the heaviest intercept bin into a hit, or `None` below the
/// presence threshold.
pub(crate) fn resolve_votes(
    votes: &HeavyHitter<u64>,
    n_query_kmers: usize,
    presence_fraction: f32,
    bandwidth: u32,
) -> Option<(u32, u64, f32)> {
    let (top_key, top_count) = votes.top()?;
    let presence = top_count as f32 / n_query_kmers as f32;
    if presence < presence_fraction {
        return None;
    }
    Some((
        posting_ref(top_key),
        posting_pos(top_key) * bandwidth as u64,
        presence,
    ))
}

/// Sort the tuple queues, histogram per-key counts into `value_offsets`,
/// report the 99th-percentile list length, and exclusive-scan the counts
/// into offsets. Afterwards `q_keys` is empty and `q_values` is the
/// posting array, sorted under the keys' stable permutation.
pub(crate) fn consolidate<V: PoolItem>(
    q_keys: &mut ChunkedQueue<u32>,
    q_values: &mut ChunkedQueue<V>,
    n_keys: usize,
    m: usize,
) -> (Vec<u64>, u32) {
    assert_eq!(q_keys.len(), q_values.len());
    info!(tuples = q_keys.len(), "sorting postings");
    let mut scratch: SortScratch<u32, V> = SortScratch::new(m);
    cq_sort_by_key(q_keys, q_values, &mut scratch);

    info!("counting unique keys");
    let mut value_offsets = vec![0u64; n_keys + 1];
    let partitions = cq_get_partitions(q_keys, m);
    assert_eq!(partitions.iter().sum::<usize>(), q_keys.len());
    for np in partitions {
        assert_eq!(q_keys.pop_front(&mut scratch.keys[..np]), np);
        let slice = &scratch.keys[..np];
        debug_assert!(slice.windows(2).all(|w| w[0] <= w[1]));
        let mut run_start = 0;
        for i in 1..=np {
            if i == np || slice[i] != slice[run_start] {
                value_offsets[slice[run_start] as usize] = (i - run_start) as u64;
                run_start = i;
            }
        }
    }
    drop(scratch);
    <u32 as PoolItem>::pool().shrink();
    V::pool().shrink();
    <u32 as PoolItem>::pool().log_usage();
    V::pool().log_usage();

    let max_occ = occ_percentile(&value_offsets);

    // Exclusive scan turns per-key counts into start offsets; the final
    // slot ends up holding the total.
    let mut acc = 0u64;
    for slot in value_offsets.iter_mut() {
        let count = *slot;
        *slot = acc;
        acc += count;
    }
    (value_offsets, max_occ)
}

/// 99th percentile of the non-zero per-key counts, with the distribution
/// summary the build log reports.
fn occ_percentile(counts: &[u64]) -> u32 {
    let mut nonzero: Vec<u64> = counts.par_iter().copied().filter(|&c| c != 0).collect();
    if nonzero.is_empty() {
        return 0;
    }
    nonzero.par_sort_unstable();
    let p99 = nonzero[nonzero.len() * 99 / 100];
    info!(
        distinct = nonzero.len(),
        min = nonzero[0],
        median = nonzero[nonzero.len() / 2],
        max = nonzero[nonzero.len() - 1],
        p99,
        "posting list lengths"
    );
    p99.min(u32::MAX as u64) as u32
}

/// Static coordinate index: one posting per reference k-mer, CSR postings
/// after [`build`](RefIndex::build).
pub struct CoordIndex {
    cfg: IndexConfig,
    headers: Vec<String>,
    q_keys: ChunkedQueue<u32>,
    q_values: ChunkedQueue<u64>,
    csr: Option<Csr<u64>>,
    max_occ: u32,
}

impl CoordIndex {
    pub fn new(cfg: IndexConfig) -> Self {
        CoordIndex {
            cfg,
            headers: Vec::new(),
            q_keys: ChunkedQueue::new(),
            q_values: ChunkedQueue::new(),
            csr: None,
            max_occ: 0,
        }
    }

    fn csr(&self) -> &Csr<u64> {
        self.csr.as_ref().expect("index queried before build")
    }

    pub(crate) fn config_mut(&mut self) -> &mut IndexConfig {
        &mut self.cfg
    }

    pub(crate) fn dump_body<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        crate::io::write_str_table(w, &self.headers)?;
        self.csr().dump(w)?;
        self.max_occ.write_le(w)?;
        Ok(())
    }

    pub(crate) fn load_body<R: Read>(r: &mut R, cfg: IndexConfig) -> std::io::Result<Self> {
        let headers = crate::io::read_str_table(r)?;
        let csr = Csr::load(r, cfg.compressed)?;
        let max_occ = u32::read_le(r)?;
        Ok(CoordIndex {
            cfg,
            headers,
            q_keys: ChunkedQueue::new(),
            q_values: ChunkedQueue::new(),
            csr: Some(csr),
            max_occ,
        })
    }
}

impl RefIndex for CoordIndex {
    fn params(&self) -> &IndexConfig {
        &self.cfg
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn max_occ(&self) -> u32 {
        self.max_occ
    }

    fn init_query_buffers(&self) {
        VOTES.with(|v| v.borrow_mut().reset());
    }

    fn add_record(&mut self, name: String, seq: &[u8]) {
        let id = self.headers.len();
        assert!(id < MAX_REFS, "reference id space exhausted");
        assert!((seq.len() as u64) < MAX_REF_POS, "reference too long");
        self.headers.push(name);

        let kmers = kmers_par(seq, self.cfg.k as usize, self.cfg.sigma, self.cfg.encoder());
        let postings: Vec<u64> = (0..kmers.len() as u64)
            .map(|pos| make_posting(id as u32, pos))
            .collect();
        self.q_keys.push_back(&kmers);
        self.q_values.push_back(&postings);
    }

    fn build(&mut self) {
        let n_keys = self.cfg.n_keys() as usize;
        let m = self.cfg.sort_block_size as usize;
        let (offsets, max_occ) = consolidate(&mut self.q_keys, &mut self.q_values, n_keys, m);
        self.max_occ = max_occ;
        let mut csr = Csr::from_parts(offsets, mem::take(&mut self.q_values));
        if self.cfg.compressed {
            debug!("re-encoding postings with Elias codes");
            csr.compress();
        }
        self.csr = Some(csr);
    }

    fn search_oriented(&self, seq: &[u8]) -> Option<(u32, u64, f32)> {
        let csr = self.csr();
        let keys = kmers_rolling(seq, self.cfg.k as usize, self.cfg.sigma, self.cfg.encoder());
        if keys.is_empty() {
            return None;
        }
        VOTES.with(|votes| {
            let votes = &mut *votes.borrow_mut();
            votes.reset();
            vote_postings(&keys, self.cfg.bandwidth, |key| csr.list(key), votes);
            resolve_votes(votes, keys.len(), self.cfg.presence_fraction, self.cfg.bandwidth)
        })
    }
}

/// The three index shapes behind one dispatch point. The on-disk formats
/// genuinely differ, so this stays a tagged variant instead of one struct
/// with mode flags.
pub enum AnyIndex {
    Coord(CoordIndex),
    Jaccard(JaccardIndex),
    Dynamic(DynamicIndex),
}

impl AnyIndex {
    pub fn new(cfg: IndexConfig) -> Self {
        if cfg.dynamic {
            AnyIndex::Dynamic(DynamicIndex::new(cfg))
        } else if cfg.jaccard {
            AnyIndex::Jaccard(JaccardIndex::new(cfg))
        } else {
            AnyIndex::Coord(CoordIndex::new(cfg))
        }
    }

    pub fn config(&self) -> &IndexConfig {
        self.params()
    }

    /// Override the query-time knobs of a loaded index. Build-critical
    /// parameters are fixed by the file and checked by the caller.
    pub fn set_query_params(&mut self, bandwidth: Option<u32>, presence_fraction: Option<f32>) {
        let cfg = match self {
            AnyIndex::Coord(i) => i.config_mut(),
            AnyIndex::Jaccard(i) => i.config_mut(),
            AnyIndex::Dynamic(i) => i.config_mut(),
        };
        if let Some(bw) = bandwidth {
            cfg.bandwidth = bw;
        }
        if let Some(pf) = presence_fraction {
            cfg.presence_fraction = pf;
        }
    }

    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.params().dump(w)?;
        match self {
            AnyIndex::Coord(i) => i.dump_body(w),
            AnyIndex::Jaccard(i) => i.dump_body(w),
            AnyIndex::Dynamic(i) => i.dump_body(w),
        }
    }

    pub fn load<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let cfg = IndexConfig::load(r)?;
        if cfg.dynamic {
            Ok(AnyIndex::Dynamic(DynamicIndex::load_body(r, cfg)?))
        } else if cfg.jaccard {
            Ok(AnyIndex::Jaccard(JaccardIndex::load_body(r, cfg)?))
        } else {
            Ok(AnyIndex::Coord(CoordIndex::load_body(r, cfg)?))
        }
    }

    pub fn dump_to_path(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "dumping index");
        let file = File::create(path).map_err(|e| Error::file(path, e))?;
        let mut w = BufWriter::new(file);
        self.dump(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading index");
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        let mut r = BufReader::new(file);
        AnyIndex::load(&mut r).map_err(|e| Error::from_read(e, "index file"))
    }
}

impl RefIndex for AnyIndex {
    fn params(&self) -> &IndexConfig {
        match self {
            AnyIndex::Coord(i) => i.params(),
            AnyIndex::Jaccard(i) => i.params(),
            AnyIndex::Dynamic(i) => i.params(),
        }
    }

    fn headers(&self) -> &[String] {
        match self {
            AnyIndex::Coord(i) => i.headers(),
            AnyIndex::Jaccard(i) => i.headers(),
            AnyIndex::Dynamic(i) => i.headers(),
        }
    }

    fn max_occ(&self) -> u32 {
        match self {
            AnyIndex::Coord(i) => i.max_occ(),
            AnyIndex::Jaccard(i) => i.max_occ(),
            AnyIndex::Dynamic(i) => i.max_occ(),
        }
    }

    fn init_query_buffers(&self) {
        match self {
            AnyIndex::Coord(i) => i.init_query_buffers(),
            AnyIndex::Jaccard(i) => i.init_query_buffers(),
            AnyIndex::Dynamic(i) => i.init_query_buffers(),
        }
    }

    fn add_record(&mut self, name: String, seq: &[u8]) {
        match self {
            AnyIndex::Coord(i) => i.add_record(name, seq),
            AnyIndex::Jaccard(i) => i.add_record(name, seq),
            AnyIndex::Dynamic(i) => i.add_record(name, seq),
        }
    }

    fn build(&mut self) {
        match self {
            AnyIndex::Coord(i) => i.build(),
            AnyIndex::Jaccard(i) => i.build(),
            AnyIndex::Dynamic(i) => i.build(),
        }
    }

    fn search_oriented(&self, seq: &[u8]) -> Option<(u32, u64, f32)> {
        match self {
            AnyIndex::Coord(i) => i.search_oriented(seq),
            AnyIndex::Jaccard(i) => i.search_oriented(seq),
            AnyIndex::Dynamic(i) => i.search_oriented(seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    #[test]
    fn posting_fields_round_trip() {
        let v = make_posting(123, 456_789);
        assert_eq!(posting_ref(v), 123);
        assert_eq!(posting_pos(v), 456_789);
        let v = make_posting((1 << 20) - 1, MAX_REF_POS - 1);
        assert_eq!(posting_ref(v), (1 << 20) - 1);
        assert_eq!(posting_pos(v), MAX_REF_POS - 1);
    }

    fn small_cfg() -> IndexConfig {
        IndexConfig::default().k(4).bandwidth(15).presence_fraction(0.1)
    }

    #[test]
    fn exact_match_has_full_presence() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("ref1", b"ACGTACGTACGTACGT");
        idx.build();
        idx.init_query_buffers();

        let hit = idx.search(b"ACGTACGTACGTACGT");
        assert_eq!(hit.ref_name, Some("ref1"));
        assert!(hit.forward);
        assert_eq!(hit.position, 0);
        assert!(hit.presence >= 1.0);
    }

    #[test]
    fn short_query_is_unmapped_without_lookup() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("ref1", b"ACGTACGTACGTACGT");
        idx.build();
        // Exactly 2k long: sentinel.
        assert_eq!(idx.search(b"ACGTACGT"), Alignment::unmapped());
    }

    #[test]
    fn unrelated_query_is_unmapped() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("ref1", b"ACGTACGTACGTACGT");
        idx.build();
        assert_eq!(idx.search(b"GGGGGGGGGGGG"), Alignment::unmapped());
    }

    #[test]
    fn reverse_complement_is_found_on_the_minus_strand() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("ref1", b"ACGTACGTAAAA");
        idx.build();
        let hit = idx.search(b"TTTTACGTACGT");
        assert_eq!(hit.ref_name, Some("ref1"));
        assert!(!hit.forward);
        assert_eq!(hit.position, 0);
        assert!(hit.presence >= 1.0);
    }

    #[test]
    fn both_strand_index_searches_forward_only() {
        let mut idx = CoordIndex::new(small_cfg().fwd_rev(true));
        idx.add("ref1", b"ACGTACGTAAAA");
        idx.build();
        assert_eq!(idx.headers(), &["ref1+".to_string(), "ref1-".to_string()]);

        let hit = idx.search(b"TTTTACGTACGT");
        assert_eq!(hit.ref_name, Some("ref1-"));
        assert!(hit.forward);
    }

    #[test]
    fn empty_corpus_yields_an_empty_index() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.build();
        assert_eq!(idx.max_occ(), 0);
        assert_eq!(idx.search(b"ACGTACGTACGTACGT"), Alignment::unmapped());
    }

    #[test]
    fn references_shorter_than_k_are_skipped() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("tiny", b"ACG");
        idx.add("ref1", b"ACGTACGTACGTACGT");
        idx.build();
        let hit = idx.search(b"ACGTACGTACGTACGT");
        assert_eq!(hit.ref_name, Some("ref1"));
    }

    #[test]
    fn duplicate_references_do_not_crash_and_map_somewhere() {
        let mut idx = CoordIndex::new(small_cfg());
        let seq = vec![b'A'; 100];
        idx.add("r1", &seq);
        idx.add("r2", &seq);
        idx.build();
        let hit = idx.search(&vec![b'A'; 50]);
        assert!(hit.ref_name.is_some());
        assert!(hit.presence >= 0.9);
    }

    #[test]
    fn get_returns_exactly_the_inserted_postings() {
        let mut idx = CoordIndex::new(small_cfg());
        idx.add("r", b"ACGTAACGTA");
        idx.build();
        let csr = idx.csr();
        let k = crate::kmer::encode_kmer(b"ACGT", 4, 4, crate::kmer::encode_dna);
        let hits: Vec<u64> = csr.list(k).collect();
        // ACGT occurs at positions 0 and 5.
        assert_eq!(hits, vec![make_posting(0, 0), make_posting(0, 5)]);
        let total: u64 = csr.n_values();
        assert_eq!(total, 7); // 10 - 4 + 1 k-mers
    }
}
