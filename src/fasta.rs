//! Record reader for FASTA and FASTQ files.
//!
//! Names stop at the first whitespace; FASTA sequences may span lines.
//! The index and query drivers only need `(name, sequence)` pairs, so
//! quality lines are read and dropped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct FastxRecord {
    pub name: String,
    pub seq: Vec<u8>,
}

pub struct FastxReader<R: BufRead> {
    input: R,
    line: String,
    /// FASTA header already consumed while scanning the previous record.
    pending: Option<String>,
}

impl FastxReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        Ok(FastxReader::new(BufReader::new(file)))
    }
}

impl<R: BufRead> FastxReader<R> {
    pub fn new(input: R) -> Self {
        FastxReader {
            input,
            line: String::new(),
            pending: None,
        }
    }

    fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        let n = self.input.read_line(&mut self.line)?;
        Ok(n > 0)
    }

    fn name_of(header: &str) -> String {
        header[1..]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string()
    }

    /// Next record, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<FastxRecord>> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => loop {
                if !self.read_line()? {
                    return Ok(None);
                }
                let line = self.line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if line.starts_with('>') || line.starts_with('@') {
                    break line.to_string();
                }
                return Err(Error::Malformed(format!(
                    "expected a FASTA/FASTQ header, got '{}'",
                    line.chars().take(20).collect::<String>()
                )));
            },
        };

        if header.starts_with('@') {
            // FASTQ: sequence line, separator, quality line.
            if !self.read_line()? {
                return Err(Error::Malformed("record truncated after header".into()));
            }
            let seq = self.line.trim_end().as_bytes().to_vec();
            if !self.read_line()? || !self.line.starts_with('+') {
                return Err(Error::Malformed("missing '+' separator".into()));
            }
            if !self.read_line()? {
                return Err(Error::Malformed("missing quality line".into()));
            }
            return Ok(Some(FastxRecord {
                name: Self::name_of(&header),
                seq,
            }));
        }

        // FASTA: sequence lines until the next header or end of input.
        let mut seq = Vec::new();
        loop {
            if !self.read_line()? {
                break;
            }
            let line = self.line.trim_end();
            if line.starts_with('>') || line.starts_with('@') {
                self.pending = Some(line.to_string());
                break;
            }
            seq.extend_from_slice(line.as_bytes());
        }
        Ok(Some(FastxRecord {
            name: Self::name_of(&header),
            seq,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(text: &str) -> Vec<FastxRecord> {
        let mut reader = FastxReader::new(text.as_bytes());
        let mut out = Vec::new();
        while let Some(rec) = reader.next_record().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn multi_line_fasta() {
        let records = read_all(">chr1 some description\nACGT\nACGT\n\n>chr2\nTTTT\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "chr1");
        assert_eq!(records[0].seq, b"ACGTACGT");
        assert_eq!(records[1].name, "chr2");
        assert_eq!(records[1].seq, b"TTTT");
    }

    #[test]
    fn fastq_records() {
        let records = read_all("@read1\nACGT\n+\nIIII\n@read2 extra\nTT\n+read2\n##\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "read1");
        assert_eq!(records[0].seq, b"ACGT");
        assert_eq!(records[1].name, "read2");
        assert_eq!(records[1].seq, b"TT");
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(read_all("").is_empty());
        assert!(read_all("\n\n").is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let mut reader = FastxReader::new("ACGT\n".as_bytes());
        assert!(matches!(reader.next_record(), Err(Error::Malformed(_))));
    }

    #[test]
    fn truncated_fastq_is_malformed() {
        let mut reader = FastxReader::new("@read1\nACGT\n".as_bytes());
        assert!(matches!(reader.next_record(), Err(Error::Malformed(_))));
    }
}
