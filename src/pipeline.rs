//! File-level drivers: stream references into an index, stream queries
//! through it in parallel batches, write the TSV report.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::BATCH_SZ;
use crate::error::{Error, Result};
use crate::fasta::{FastxReader, FastxRecord};
use crate::index::{Alignment, AnyIndex, RefIndex};
use crate::poremodel::PoreModel;

fn ingest_spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template"),
    );
    bar
}

/// Read every record of `path` into the index, then build it.
pub fn index_fasta(index: &mut AnyIndex, path: &Path, pore: Option<&PoreModel>) -> Result<()> {
    info!(path = %path.display(), "indexing references");
    let mut reader = FastxReader::open(path)?;
    let bar = ingest_spinner();
    let mut n_refs = 0u64;
    while let Some(record) = reader.next_record()? {
        match pore {
            Some(model) => index.add(&record.name, &model.quantized(&record.seq)),
            None => index.add(&record.name, &record.seq),
        }
        n_refs += 1;
        if n_refs % 256 == 0 {
            bar.set_message(format!("{n_refs} references"));
            bar.tick();
        }
    }
    bar.finish_and_clear();
    info!(n_refs, "building index");
    index.build();
    Ok(())
}

fn write_alignment<W: Write>(
    out: &mut W,
    record: &FastxRecord,
    alignment: &Alignment<'_>,
) -> std::io::Result<()> {
    writeln!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{:.4}",
        record.name,
        record.seq.len(),
        alignment.ref_name.unwrap_or("*"),
        if alignment.forward { '+' } else { '-' },
        alignment.position,
        alignment.presence,
    )
}

/// Stream queries through the index in batches of [`BATCH_SZ`], searching
/// each batch across the worker pool and writing results in input order.
/// The output file is written only from this thread.
pub fn query_fasta(index: &AnyIndex, qry: &Path, out: &Path, pore: Option<&PoreModel>) -> Result<()> {
    index.init_query_buffers();
    info!(path = %qry.display(), "aligning queries");
    let mut reader = FastxReader::open(qry)?;
    let file = File::create(out).map_err(|e| Error::file(out, e))?;
    let mut writer = BufWriter::new(file);

    let mut batch: Vec<FastxRecord> = Vec::with_capacity(BATCH_SZ);
    let mut total = 0u64;
    loop {
        batch.clear();
        while batch.len() < BATCH_SZ {
            match reader.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }

        let alignments: Vec<Alignment<'_>> = batch
            .par_iter()
            .map(|record| match pore {
                Some(model) => index.search(&model.quantized(&record.seq)),
                None => index.search(&record.seq),
            })
            .collect();

        for (record, alignment) in batch.iter().zip(alignments.iter()) {
            write_alignment(&mut writer, record, alignment)?;
        }
        total += batch.len() as u64;
        debug!(total, "aligned");
    }
    writer.flush()?;
    info!(total, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    fn write_fasta(records: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (name, seq) in records {
            writeln!(file, ">{name}\n{seq}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn index_then_query_writes_one_line_per_query() {
        let refs = write_fasta(&[("ref1", "ACGTACGTACGTACGT")]);
        let queries = write_fasta(&[
            ("hit", "ACGTACGTACGTACGT"),
            ("miss", "GGGGGGGGGGGG"),
            ("tiny", "ACGT"),
        ]);
        let out = tempfile::NamedTempFile::new().unwrap();

        let cfg = IndexConfig::default().k(4).bandwidth(15).presence_fraction(0.1);
        let mut index = AnyIndex::new(cfg);
        index_fasta(&mut index, refs.path(), None).unwrap();
        query_fasta(&index, queries.path(), out.path(), None).unwrap();

        let text = std::fs::read_to_string(out.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let hit: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(hit[0], "hit");
        assert_eq!(hit[1], "16");
        assert_eq!(hit[2], "ref1");
        assert_eq!(hit[3], "+");
        assert_eq!(hit[4], "0");
        assert!(hit[5].parse::<f32>().unwrap() >= 1.0);

        for line in &lines[1..] {
            let cols: Vec<&str> = line.split('\t').collect();
            assert_eq!(cols[2], "*");
            assert_eq!(cols[3], "+");
            assert_eq!(cols[4], "0");
            assert_eq!(cols[5].parse::<f32>().unwrap(), 0.0);
        }
    }
}
