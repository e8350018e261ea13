//! Build and query parameters, shared by every index shape and persisted
//! as the fixed-size config block at the head of a `.cidx` file.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::io::LeField;
use crate::pool::BLOCK_LEN;

/// Queries handled per parallel batch.
pub const BATCH_SZ: usize = 4096;

pub const DEFAULT_K_DNA: u32 = 15;
pub const DEFAULT_K_QSIG: u32 = 8;
pub const SIGMA_DNA: u32 = 4;
pub const SIGMA_QSIG: u32 = 16;
pub const DEFAULT_BANDWIDTH: u32 = 15;
pub const DEFAULT_PRESENCE_FRACTION: f32 = 0.1;
pub const DEFAULT_FRAG_LEN: u32 = 180;
pub const DEFAULT_FRAG_OVLP_LEN: u32 = 120;
pub const DEFAULT_SHARD_BITS: u32 = 10;

mod flag {
    pub const JACCARD: u32 = 1 << 0;
    pub const FWD_REV: u32 = 1 << 1;
    pub const COMPRESSED: u32 = 1 << 2;
    pub const DYNAMIC: u32 = 1 << 3;
}

/// Everything the build needs to be reproduced and the query path needs to
/// interpret an index. Built with chained setters:
///
/// ```
/// use collinear::IndexConfig;
/// let cfg = IndexConfig::default().k(11).bandwidth(10).fwd_rev(true);
/// assert_eq!(cfg.k, 11);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub k: u32,
    pub sigma: u32,
    pub bandwidth: u32,
    pub frag_len: u32,
    pub frag_ovlp_len: u32,
    pub n_shard_bits: u32,
    pub presence_fraction: f32,
    pub jaccard: bool,
    pub fwd_rev: bool,
    pub compressed: bool,
    pub dynamic: bool,
    /// External-sort partition size, in elements.
    pub sort_block_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            k: DEFAULT_K_DNA,
            sigma: SIGMA_DNA,
            bandwidth: DEFAULT_BANDWIDTH,
            frag_len: DEFAULT_FRAG_LEN,
            frag_ovlp_len: DEFAULT_FRAG_OVLP_LEN,
            n_shard_bits: DEFAULT_SHARD_BITS,
            presence_fraction: DEFAULT_PRESENCE_FRACTION,
            jaccard: false,
            fwd_rev: false,
            compressed: false,
            dynamic: false,
            sort_block_size: BLOCK_LEN as u64,
        }
    }
}

impl IndexConfig {
    pub fn k(mut self, k: u32) -> Self {
        self.k = k;
        self
    }

    pub fn sigma(mut self, sigma: u32) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn bandwidth(mut self, bandwidth: u32) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn presence_fraction(mut self, pf: f32) -> Self {
        self.presence_fraction = pf;
        self
    }

    pub fn fwd_rev(mut self, yes: bool) -> Self {
        self.fwd_rev = yes;
        self
    }

    pub fn jaccard(mut self, yes: bool) -> Self {
        self.jaccard = yes;
        self
    }

    pub fn compressed(mut self, yes: bool) -> Self {
        self.compressed = yes;
        self
    }

    pub fn dynamic(mut self, yes: bool) -> Self {
        self.dynamic = yes;
        self
    }

    pub fn frag_len(mut self, len: u32) -> Self {
        self.frag_len = len;
        self
    }

    pub fn frag_ovlp_len(mut self, len: u32) -> Self {
        self.frag_ovlp_len = len;
        self
    }

    pub fn n_shard_bits(mut self, bits: u32) -> Self {
        self.n_shard_bits = bits;
        self
    }

    pub fn sort_block_size(mut self, elements: u64) -> Self {
        // Anything below one pool block is clamped up.
        self.sort_block_size = elements.max(BLOCK_LEN as u64);
        self
    }

    /// Size of the key space, σᵏ.
    pub fn n_keys(&self) -> u64 {
        (self.sigma as u64).pow(self.k)
    }

    /// The byte-to-symbol encoder for this alphabet.
    pub fn encoder(&self) -> fn(u8) -> u32 {
        if self.sigma == SIGMA_QSIG {
            crate::kmer::encode_qsig
        } else {
            crate::kmer::encode_dna
        }
    }

    pub fn validate(&self) -> Result<()> {
        let max_k = match self.sigma {
            SIGMA_DNA => 16,
            SIGMA_QSIG => 8,
            other => {
                return Err(Error::Usage(format!("unsupported alphabet size {other}")));
            }
        };
        if self.k < 1 || self.k > max_k {
            return Err(Error::Usage(format!(
                "k = {} out of range 1..={max_k} for sigma = {}",
                self.k, self.sigma
            )));
        }
        if self.jaccard && self.frag_ovlp_len >= self.frag_len {
            return Err(Error::Usage(format!(
                "fragment overlap {} must be smaller than fragment length {}",
                self.frag_ovlp_len, self.frag_len
            )));
        }
        if self.dynamic && (self.n_shard_bits >= 32 || (1u64 << self.n_shard_bits) > self.n_keys()) {
            return Err(Error::Usage(format!(
                "{} shard bits exceed the key space for k = {}",
                self.n_shard_bits, self.k
            )));
        }
        if !(0.0..=1.0).contains(&self.presence_fraction) {
            return Err(Error::Usage(format!(
                "presence fraction {} outside [0, 1]",
                self.presence_fraction
            )));
        }
        Ok(())
    }

    fn flags(&self) -> u32 {
        let mut f = 0;
        if self.jaccard {
            f |= flag::JACCARD;
        }
        if self.fwd_rev {
            f |= flag::FWD_REV;
        }
        if self.compressed {
            f |= flag::COMPRESSED;
        }
        if self.dynamic {
            f |= flag::DYNAMIC;
        }
        f
    }

    /// Write the fixed 40-byte config block.
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.k.write_le(w)?;
        self.sigma.write_le(w)?;
        self.bandwidth.write_le(w)?;
        self.frag_len.write_le(w)?;
        self.frag_ovlp_len.write_le(w)?;
        self.n_shard_bits.write_le(w)?;
        self.presence_fraction.write_le(w)?;
        self.flags().write_le(w)?;
        self.sort_block_size.write_le(w)?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let k = u32::read_le(r)?;
        let sigma = u32::read_le(r)?;
        let bandwidth = u32::read_le(r)?;
        let frag_len = u32::read_le(r)?;
        let frag_ovlp_len = u32::read_le(r)?;
        let n_shard_bits = u32::read_le(r)?;
        let presence_fraction = f32::read_le(r)?;
        let flags = u32::read_le(r)?;
        let sort_block_size = u64::read_le(r)?;
        Ok(IndexConfig {
            k,
            sigma,
            bandwidth,
            frag_len,
            frag_ovlp_len,
            n_shard_bits,
            presence_fraction,
            jaccard: flags & flag::JACCARD != 0,
            fwd_rev: flags & flag::FWD_REV != 0,
            compressed: flags & flag::COMPRESSED != 0,
            dynamic: flags & flag::DYNAMIC != 0,
            sort_block_size,
        })
    }
}

/// Parse a human-readable size: decimal digits with an optional K/M/G
/// suffix (binary, case-insensitive). No suffix means a plain count.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Usage("empty size".into()));
    }
    let (digits, mult) = match text.as_bytes()[text.len() - 1] {
        b'k' | b'K' => (&text[..text.len() - 1], 1u64 << 10),
        b'm' | b'M' => (&text[..text.len() - 1], 1u64 << 20),
        b'g' | b'G' => (&text[..text.len() - 1], 1u64 << 30),
        c if c.is_ascii_digit() => (text, 1),
        c => {
            return Err(Error::Usage(format!("unknown size unit '{}'", c as char)));
        }
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Usage(format!("bad size '{text}'")))?;
    Ok(value * mult)
}
