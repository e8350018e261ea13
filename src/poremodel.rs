//! Pore-model loading and squiggle quantization.
//!
//! A pore model maps every DNA k-mer to an expected current level. With a
//! model loaded, references and queries are projected to their per-k-mer
//! levels ("squiggles"), quantized into sixteen symbols with a fixed
//! bin-edge table, and the quantized bytes feed the index through the
//! identity encoder.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::kmer::{encode_dna, encode_kmer, kmers_rolling};

/// Z-score boundaries of the sixteen signal symbols.
pub const BIN_EDGES_16: [f64; 15] = [
    -1.605, -1.23, -0.995, -0.745, -0.576, -0.408, -0.188, 0.068, 0.277, 0.471, 0.637, 0.796,
    0.946, 1.133, 1.4,
];

pub struct PoreModel {
    pub k: u32,
    /// Level per k-mer code, z-normalized; indexed by [`encode_dna`] codes.
    levels: Vec<f64>,
}

impl PoreModel {
    /// Read a tab-separated model (header line, then `kmer<TAB>level`
    /// rows). Every one of the 4ᵏ k-mers must be present.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        let mut lines = BufReader::new(file).lines();
        lines
            .next()
            .transpose()?
            .ok_or_else(|| Error::Malformed("pore model is empty".into()))?;

        let mut kmers: Vec<String> = Vec::new();
        let mut raw_levels: Vec<f64> = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let kmer = fields
                .next()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| Error::Malformed("pore model row without a k-mer".into()))?;
            let level: f64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Malformed(format!("bad level for k-mer {kmer}")))?;
            kmers.push(kmer.to_string());
            raw_levels.push(level);
        }
        if kmers.is_empty() {
            return Err(Error::Malformed("pore model has no rows".into()));
        }

        let k = kmers[0].len() as u32;
        info!(k, rows = kmers.len(), "loaded pore model");
        let expected = 1usize << (2 * k);
        if kmers.len() != expected {
            return Err(Error::Malformed(format!(
                "pore model has {} rows, expected {expected} for k = {k}",
                kmers.len()
            )));
        }

        let mut levels = vec![f64::NAN; expected];
        for (kmer, level) in kmers.iter().zip(raw_levels.iter()) {
            if kmer.len() != k as usize {
                return Err(Error::Malformed(format!("k-mer {kmer} has mixed length")));
            }
            let code = encode_kmer(kmer.as_bytes(), k as usize, 4, encode_dna) as usize;
            levels[code] = *level;
        }
        if levels.iter().any(|l| l.is_nan()) {
            return Err(Error::Malformed("k-mers missing from pore model".into()));
        }

        // Z-normalize so the quantizer's bin edges apply.
        let n = levels.len() as f64;
        let mean = levels.iter().sum::<f64>() / n;
        let var = levels.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / n;
        let stdev = var.sqrt();
        info!(mean, stdev, "normalizing pore model levels");
        for level in &mut levels {
            *level = (*level - mean) / stdev;
        }
        Ok(PoreModel { k, levels })
    }

    /// Expected signal levels of `seq`, one per k-mer window.
    pub fn squiggles(&self, seq: &[u8]) -> Vec<f64> {
        kmers_rolling(seq, self.k as usize, 4, encode_dna)
            .into_iter()
            .map(|code| self.levels[code as usize])
            .collect()
    }

    /// Project and quantize a sequence into the 16-symbol alphabet.
    pub fn quantized(&self, seq: &[u8]) -> Vec<u8> {
        quantize(&self.squiggles(seq))
    }
}

/// Map each level to the index of its bin, a symbol in `0..16`.
pub fn quantize(signal: &[f64]) -> Vec<u8> {
    signal
        .iter()
        .map(|&x| BIN_EDGES_16.partition_point(|&edge| edge < x) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_model(k: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kmer\tlevel_mean").unwrap();
        let n = 1usize << (2 * k);
        for code in 0..n {
            let mut name = String::new();
            for i in (0..k).rev() {
                name.push(b"ACTG"[(code >> (2 * i)) & 3] as char);
            }
            writeln!(file, "{name}\t{}", 60.0 + code as f64).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_and_normalizes_a_complete_model() {
        let file = write_model(3);
        let model = PoreModel::load(file.path()).unwrap();
        assert_eq!(model.k, 3);
        let mean: f64 = model.levels.iter().sum::<f64>() / model.levels.len() as f64;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn incomplete_models_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kmer\tlevel_mean").unwrap();
        writeln!(file, "AAA\t60.0").unwrap();
        writeln!(file, "AAC\t61.0").unwrap();
        file.flush().unwrap();
        assert!(matches!(PoreModel::load(file.path()), Err(Error::Malformed(_))));
    }

    #[test]
    fn quantization_is_monotone_over_the_bins() {
        assert_eq!(quantize(&[-10.0])[0], 0);
        assert_eq!(quantize(&[10.0])[0], 15);
        let symbols = quantize(&[-1.7, -0.5, 0.0, 0.5, 1.5]);
        assert!(symbols.windows(2).all(|w| w[0] <= w[1]));
        assert!(symbols.iter().all(|&s| s < 16));
    }

    #[test]
    fn sequences_project_through_the_model() {
        let file = write_model(3);
        let model = PoreModel::load(file.path()).unwrap();
        let symbols = model.quantized(b"ACGTACGT");
        assert_eq!(symbols.len(), 6); // 8 - 3 + 1 windows
        assert!(symbols.iter().all(|&s| s < 16));
        // Identical windows give identical symbols.
        assert_eq!(symbols[0], symbols[4]);
    }
}
