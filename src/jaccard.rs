//! Fragment index: references are cut into overlapping windows and the
//! fragment id, not a coordinate, is the unit of retrieval.
//!
//! Every k-mer of fragment `j` of reference `r` posts the constant
//! `frag_offsets[r] + j`, so a query's votes go straight to fragment ids
//! and the winner is mapped back to `(reference, position)` through the
//! monotone `frag_offsets` table.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::mem;

use tracing::debug;

use crate::config::IndexConfig;
use crate::cqueue::ChunkedQueue;
use crate::csr::Csr;
use crate::heavyhitter::HeavyHitter;
use crate::index::{consolidate, RefIndex, MAX_REFS};
use crate::io::LeField;
use crate::kmer::{kmers_par, kmers_rolling};

thread_local! {
    static FRAG_VOTES: RefCell<HeavyHitter<u32>> = RefCell::new(HeavyHitter::default());
}

pub struct JaccardIndex {
    cfg: IndexConfig,
    headers: Vec<String>,
    q_keys: ChunkedQueue<u32>,
    q_values: ChunkedQueue<u32>,
    csr: Option<Csr<u32>>,
    /// `frag_offsets[r]` is the first fragment id of reference `r`; the
    /// trailing entry is the total fragment count.
    frag_offsets: Vec<u32>,
    max_occ: u32,
}

impl JaccardIndex {
    pub fn new(cfg: IndexConfig) -> Self {
        JaccardIndex {
            cfg,
            headers: Vec::new(),
            q_keys: ChunkedQueue::new(),
            q_values: ChunkedQueue::new(),
            csr: None,
            frag_offsets: vec![0],
            max_occ: 0,
        }
    }

    #[inline]
    fn stride(&self) -> u32 {
        self.cfg.frag_len - self.cfg.frag_ovlp_len
    }

    fn csr(&self) -> &Csr<u32> {
        self.csr.as_ref().expect("index queried before build")
    }

    pub(crate) fn config_mut(&mut self) -> &mut IndexConfig {
        &mut self.cfg
    }

    pub(crate) fn dump_body<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        crate::io::write_str_table(w, &self.headers)?;
        self.csr().dump(w)?;
        self.max_occ.write_le(w)?;
        (self.frag_offsets.len() as u32).write_le(w)?;
        self.cfg.frag_len.write_le(w)?;
        self.cfg.frag_ovlp_len.write_le(w)?;
        crate::io::write_slice(w, &self.frag_offsets)?;
        Ok(())
    }

    pub(crate) fn load_body<R: Read>(r: &mut R, mut cfg: IndexConfig) -> std::io::Result<Self> {
        let headers = crate::io::read_str_table(r)?;
        let csr = Csr::load(r, cfg.compressed)?;
        let max_occ = u32::read_le(r)?;
        let n_frag_offsets = u32::read_le(r)? as usize;
        cfg.frag_len = u32::read_le(r)?;
        cfg.frag_ovlp_len = u32::read_le(r)?;
        let frag_offsets = crate::io::read_vec(r, n_frag_offsets)?;
        Ok(JaccardIndex {
            cfg,
            headers,
            q_keys: ChunkedQueue::new(),
            q_values: ChunkedQueue::new(),
            csr: Some(csr),
            frag_offsets,
            max_occ,
        })
    }
}

impl RefIndex for JaccardIndex {
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
        FRAG_VOTES.with(|v| v.borrow_mut().reset());
    }

    fn add_record(&mut self, name: String, seq: &[u8]) {
        assert!(self.headers.len() < MAX_REFS, "reference id space exhausted");
        self.headers.push(name);
        let base = *self.frag_offsets.last().unwrap();

        let kmers = kmers_par(seq, self.cfg.k as usize, self.cfg.sigma, self.cfg.encoder());
        let frag_len = self.cfg.frag_len as usize;
        let stride = self.stride() as usize;
        let mut fragments = 0u32;
        let mut start = 0;
        while start < kmers.len() {
            let count = frag_len.min(kmers.len() - start);
            self.q_keys.push_back(&kmers[start..start + count]);
            self.q_values.push_back(&vec![base + fragments; count]);
            start += stride;
            fragments += 1;
        }
        self.frag_offsets.push(base + fragments);
    }

    fn build(&mut self) {
        let n_keys = self.cfg.n_keys() as usize;
        let m = self.cfg.sort_block_size as usize;
        let (offsets, max_occ) = consolidate(&mut self.q_keys, &mut self.q_values, n_keys, m);
        self.max_occ = max_occ;
        let mut csr = Csr::from_parts(offsets, mem::take(&mut self.q_values));
        if self.cfg.compressed {
            debug!("re-encoding fragment postings with Elias codes");
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
        FRAG_VOTES.with(|votes| {
            let votes = &mut *votes.borrow_mut();
            votes.reset();
            for &key in &keys {
                for v in csr.list(key) {
                    votes.insert(v as u32);
                }
            }
            let (top_frag, top_count) = votes.top()?;
            let presence = top_count as f32 / keys.len() as f32;
            if presence < self.cfg.presence_fraction {
                return None;
            }
            // Map the fragment id back through the offsets table: the
            // owning reference is the one whose range contains the id,
            // including the case where the id sits exactly on a boundary.
            let lb = self.frag_offsets.partition_point(|&off| off <= top_frag);
            let reference = (lb - 1) as u32;
            let position = (top_frag - self.frag_offsets[lb - 1]) as u64 * self.stride() as u64;
            Some((reference, position, presence))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Alignment;

    fn cfg() -> IndexConfig {
        IndexConfig::default()
            .jaccard(true)
            .k(4)
            .frag_len(8)
            .frag_ovlp_len(4)
            .presence_fraction(0.1)
    }

    fn corpus() -> JaccardIndex {
        let mut idx = JaccardIndex::new(cfg());
        idx.add("alpha", b"ACGTACGTACGTACGTACGT");
        idx.add("beta", b"TTGCATTGCATTGCATTGCA");
        idx.build();
        idx
    }

    #[test]
    fn fragments_partition_the_kmer_stream() {
        let idx = corpus();
        // 17 k-mers per reference, fragment length 8, stride 4:
        // fragments start at 0, 4, 8, 12, 16.
        assert_eq!(idx.frag_offsets, vec![0, 5, 10]);
    }

    #[test]
    fn query_resolves_to_reference_and_offset() {
        let idx = corpus();
        let hit = idx.search(b"TTGCATTGCATTGCATTGCA");
        assert_eq!(hit.ref_name, Some("beta"));
        assert!(hit.presence > 0.5);
        // The winning fragment is the first of beta.
        assert_eq!(hit.position % idx.stride() as u64, 0);
    }

    #[test]
    fn later_fragment_reports_an_in_reference_offset() {
        let mut idx = JaccardIndex::new(cfg());
        // 40 bases: distinct halves, so a query for the tail votes for a
        // later fragment.
        idx.add("r", b"ACGTACGTACGTACGTACGTTTGCATTGCATTGCATTGCA");
        idx.build();
        let hit = idx.search(b"TTGCATTGCATTGCATTGCA");
        assert_eq!(hit.ref_name, Some("r"));
        assert!(hit.position > 0);
    }

    #[test]
    fn unrelated_query_is_unmapped() {
        let idx = corpus();
        assert_eq!(idx.search(b"AAAAAAAAAAAAAAAA"), Alignment::unmapped());
    }

    #[test]
    fn compressed_view_answers_identically() {
        let plain = corpus();
        let mut coded = JaccardIndex::new(cfg().compressed(true));
        coded.add("alpha", b"ACGTACGTACGTACGTACGT");
        coded.add("beta", b"TTGCATTGCATTGCATTGCA");
        coded.build();
        assert!(coded.csr().is_compressed());

        for q in [&b"TTGCATTGCATTGCATTGCA"[..], b"ACGTACGTACGTACGTACGT"] {
            let a = plain.search(q);
            let b = coded.search(q);
            assert_eq!(a.ref_name, b.ref_name);
            assert_eq!(a.position, b.position);
            assert_eq!(a.presence, b.presence);
        }
    }
}
