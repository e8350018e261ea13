//! Elias-coded integer arrays with sampled random access.
//!
//! Two flavors back the compressed index view: [`GammaVec`] γ-codes
//! arbitrary values, [`DeltaVec`] δ-codes the gaps of a monotone sequence.
//! Both keep the bit offset (and, for gaps, the running value) of every
//! 64th element, so a random read decodes at most 64 codes and a posting
//! list is walked with a sequential cursor anchored at the nearest sample.

use std::io::{Read, Result, Write};

use crate::io::LeField;

/// Elements per access sample.
const SAMPLE_EVERY: u64 = 64;

#[inline]
fn low_mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Append-only bit buffer, most significant bit of each pushed value first.
pub struct BitWriter {
    words: Vec<u64>,
    len: u64,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter { words: Vec::new(), len: 0 }
    }

    #[inline]
    pub fn len_bits(&self) -> u64 {
        self.len
    }

    /// Append the low `width` bits of `value`.
    pub fn push(&mut self, value: u64, width: u32) {
        debug_assert!(width == 64 || value <= low_mask(width));
        let mut rem = width;
        while rem > 0 {
            let word = (self.len / 64) as usize;
            let bit = (self.len % 64) as u32;
            if word == self.words.len() {
                self.words.push(0);
            }
            let room = 64 - bit;
            let take = rem.min(room);
            let chunk = (value >> (rem - take)) & low_mask(take);
            self.words[word] |= chunk << (room - take);
            self.len += take as u64;
            rem -= take;
        }
    }

    /// Elias-γ: `len(x) - 1` zeros, then `x` with its leading one. `x ≥ 1`.
    pub fn push_gamma(&mut self, x: u64) {
        debug_assert!(x >= 1);
        let width = 64 - x.leading_zeros();
        self.push(0, width - 1);
        self.push(x, width);
    }

    /// Elias-δ: γ-coded bit length, then the bits below the leading one.
    pub fn push_delta(&mut self, x: u64) {
        debug_assert!(x >= 1);
        let width = 64 - x.leading_zeros();
        self.push_gamma(width as u64);
        self.push(x & low_mask(width - 1), width - 1);
    }

    pub fn finish(self) -> (Vec<u64>, u64) {
        (self.words, self.len)
    }
}

/// Positioned reader over a [`BitWriter`]'s words.
pub struct BitReader<'a> {
    words: &'a [u64],
    pos: u64,
}

impl<'a> BitReader<'a> {
    pub fn at(words: &'a [u64], pos: u64) -> Self {
        BitReader { words, pos }
    }

    pub fn read(&mut self, width: u32) -> u64 {
        let mut out = 0u64;
        let mut rem = width;
        while rem > 0 {
            let word = (self.pos / 64) as usize;
            let bit = (self.pos % 64) as u32;
            let room = 64 - bit;
            let take = rem.min(room);
            let chunk = (self.words[word] >> (room - take)) & low_mask(take);
            out = if take == 64 { chunk } else { (out << take) | chunk };
            self.pos += take as u64;
            rem -= take;
        }
        out
    }

    #[inline]
    fn read_bit(&mut self) -> u64 {
        self.read(1)
    }

    pub fn read_gamma(&mut self) -> u64 {
        let mut zeros = 0u32;
        while self.read_bit() == 0 {
            zeros += 1;
        }
        if zeros == 0 {
            1
        } else {
            (1u64 << zeros) | self.read(zeros)
        }
    }

    pub fn read_delta(&mut self) -> u64 {
        let width = self.read_gamma() as u32;
        if width == 1 {
            1
        } else {
            (1u64 << (width - 1)) | self.read(width - 1)
        }
    }
}

/// γ-coded array of arbitrary integers (stored as `value + 1`).
pub struct GammaVec {
    words: Vec<u64>,
    n: u64,
    samples: Vec<u64>,
}

impl GammaVec {
    pub fn from_values<I: IntoIterator<Item = u64>>(values: I) -> Self {
        let mut w = BitWriter::new();
        let mut samples = Vec::new();
        let mut n = 0u64;
        for v in values {
            assert!(v < u64::MAX);
            if n % SAMPLE_EVERY == 0 {
                samples.push(w.len_bits());
            }
            w.push_gamma(v + 1);
            n += 1;
        }
        let (words, _) = w.finish();
        GammaVec { words, n, samples }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, i: u64) -> u64 {
        assert!(i < self.n, "compressed array index out of bounds");
        self.cursor(i).next().unwrap()
    }

    /// Sequential decoder starting at element `i`.
    pub fn cursor(&self, i: u64) -> GammaCursor<'_> {
        assert!(i <= self.n, "compressed array index out of bounds");
        if i == self.n {
            return GammaCursor { reader: BitReader::at(&self.words, 0), remaining: 0 };
        }
        let mut reader = BitReader::at(&self.words, self.samples[(i / SAMPLE_EVERY) as usize]);
        for _ in 0..i % SAMPLE_EVERY {
            reader.read_gamma();
        }
        GammaCursor { reader, remaining: self.n - i }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.n.write_le(w)?;
        (self.words.len() as u64).write_le(w)?;
        crate::io::write_slice(w, &self.words)?;
        (self.samples.len() as u64).write_le(w)?;
        crate::io::write_slice(w, &self.samples)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let n = u64::read_le(r)?;
        let n_words = u64::read_le(r)? as usize;
        let words = crate::io::read_vec(r, n_words)?;
        let n_samples = u64::read_le(r)? as usize;
        let samples = crate::io::read_vec(r, n_samples)?;
        Ok(GammaVec { words, n, samples })
    }
}

pub struct GammaCursor<'a> {
    reader: BitReader<'a>,
    remaining: u64,
}

impl Iterator for GammaCursor<'_> {
    type Item = u64;

    #[inline]
    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.reader.read_gamma() - 1)
    }
}

/// δ-coded monotone sequence, stored as gaps plus running-value samples.
pub struct DeltaVec {
    words: Vec<u64>,
    n: u64,
    samples: Vec<(u64, u64)>,
}

impl DeltaVec {
    pub fn from_values<I: IntoIterator<Item = u64>>(values: I) -> Self {
        let mut w = BitWriter::new();
        let mut samples = Vec::new();
        let mut prev = 0u64;
        let mut n = 0u64;
        for v in values {
            assert!(v >= prev, "sequence is not monotone");
            if n % SAMPLE_EVERY == 0 {
                samples.push((w.len_bits(), prev));
            }
            w.push_delta(v - prev + 1);
            prev = v;
            n += 1;
        }
        let (words, _) = w.finish();
        DeltaVec { words, n, samples }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, i: u64) -> u64 {
        assert!(i < self.n, "compressed array index out of bounds");
        let (bit, mut acc) = self.samples[(i / SAMPLE_EVERY) as usize];
        let mut reader = BitReader::at(&self.words, bit);
        for _ in 0..=i % SAMPLE_EVERY {
            acc += reader.read_delta() - 1;
        }
        acc
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.n.write_le(w)?;
        (self.words.len() as u64).write_le(w)?;
        crate::io::write_slice(w, &self.words)?;
        (self.samples.len() as u64).write_le(w)?;
        for &(bit, value) in &self.samples {
            bit.write_le(w)?;
            value.write_le(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let n = u64::read_le(r)?;
        let n_words = u64::read_le(r)? as usize;
        let words = crate::io::read_vec(r, n_words)?;
        let n_samples = u64::read_le(r)? as usize;
        let mut samples = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let bit = u64::read_le(r)?;
            let value = u64::read_le(r)?;
            samples.push((bit, value));
        }
        Ok(DeltaVec { words, n, samples })
    }
}
