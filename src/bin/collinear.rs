use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use collinear::config::{parse_size, DEFAULT_K_QSIG, SIGMA_QSIG};
use collinear::error::Error;
use collinear::pipeline::{index_fasta, query_fasta};
use collinear::poremodel::PoreModel;
use collinear::{AnyIndex, IndexConfig, RefIndex, Result};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Reference FASTA path; triggers an index build
    #[clap(long = "ref", value_parser)]
    reference: Option<PathBuf>,

    /// Index file path (input when querying, output when building)
    #[clap(long, value_parser)]
    idx: Option<PathBuf>,

    /// Query FASTA/FASTQ path
    #[clap(long, value_parser)]
    qry: Option<PathBuf>,

    /// Output TSV path
    #[clap(long, value_parser)]
    out: Option<PathBuf>,

    /// K-mer length
    #[clap(short, long)]
    k: Option<u32>,

    /// Minimum fraction of query k-mers that must support a hit
    #[clap(long = "pf")]
    presence_fraction: Option<f32>,

    /// Intercept quantization width
    #[clap(long = "bw")]
    bandwidth: Option<u32>,

    /// Index both the forward and reverse-complement strands
    #[clap(long = "fr")]
    fwd_rev: bool,

    /// Build the Jaccard fragment index instead of the coordinate index
    #[clap(long)]
    jaccard: bool,

    /// Store postings Elias-coded
    #[clap(long)]
    compressed: bool,

    /// Build the dynamic sharded index
    #[clap(long)]
    dynamic: bool,

    /// Fragment length of the Jaccard index, in k-mers
    #[clap(long = "jc-frag-len")]
    jc_frag_len: Option<u32>,

    /// Fragment overlap of the Jaccard index, in k-mers
    #[clap(long = "jc-frag-ovlp-len")]
    jc_frag_ovlp_len: Option<u32>,

    /// External-sort partition size (digits with optional K/M/G suffix);
    /// clamped up to one pool block
    #[clap(long = "sort-blksz")]
    sort_blksz: Option<String>,

    /// Shard count exponent for the dynamic index
    #[clap(long = "num-shard-bits")]
    num_shard_bits: Option<u32>,

    /// Worker threads; 0 keeps the pool default
    #[clap(long = "n_threads", default_value_t = 0)]
    n_threads: usize,

    /// Pore-model TSV; switches to the 16-symbol quantized-signal alphabet
    #[clap(long)]
    poremodel: Option<PathBuf>,
}

enum Phase {
    Index,
    Query,
    Both,
}

impl Args {
    fn phase(&self) -> Result<Phase> {
        match (&self.reference, &self.idx, &self.qry, &self.out) {
            (Some(_), _, None, None) => Ok(Phase::Index),
            (None, Some(_), Some(_), Some(_)) => Ok(Phase::Query),
            (Some(_), None, Some(_), Some(_)) => Ok(Phase::Both),
            _ => Err(Error::Usage(
                "expected --ref (index), --idx --qry --out (query), \
                 or --ref --qry --out (index and query)"
                    .into(),
            )),
        }
    }

    /// Assemble the build config, with alphabet-dependent defaults.
    fn config(&self) -> Result<IndexConfig> {
        let mut cfg = IndexConfig::default();
        if self.poremodel.is_some() {
            cfg.sigma = SIGMA_QSIG;
            cfg.k = DEFAULT_K_QSIG;
        }
        if let Some(k) = self.k {
            cfg.k = k;
        }
        if let Some(bw) = self.bandwidth {
            cfg.bandwidth = bw;
        }
        if let Some(pf) = self.presence_fraction {
            cfg.presence_fraction = pf;
        }
        if let Some(len) = self.jc_frag_len {
            cfg.frag_len = len;
        }
        if let Some(len) = self.jc_frag_ovlp_len {
            cfg.frag_ovlp_len = len;
        }
        if let Some(bits) = self.num_shard_bits {
            cfg.n_shard_bits = bits;
        }
        if let Some(size) = &self.sort_blksz {
            cfg = cfg.sort_block_size(parse_size(size)?);
        }
        cfg.fwd_rev = self.fwd_rev;
        cfg.jaccard = self.jaccard;
        cfg.compressed = self.compressed;
        cfg.dynamic = self.dynamic;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject a loaded index whose build parameters contradict anything
    /// given explicitly on this command line.
    fn check_loaded(&self, loaded: &IndexConfig) -> Result<()> {
        fn conflict<T: PartialEq + std::fmt::Display>(
            name: &str,
            requested: Option<T>,
            stored: T,
        ) -> Result<()> {
            match requested {
                Some(r) if r != stored => Err(Error::ConfigMismatch(format!(
                    "{name}: requested {r}, index was built with {stored}"
                ))),
                _ => Ok(()),
            }
        }
        conflict("k", self.k, loaded.k)?;
        conflict("jc-frag-len", self.jc_frag_len, loaded.frag_len)?;
        conflict("jc-frag-ovlp-len", self.jc_frag_ovlp_len, loaded.frag_ovlp_len)?;
        conflict("num-shard-bits", self.num_shard_bits, loaded.n_shard_bits)?;
        conflict("jaccard", self.jaccard.then_some(true), loaded.jaccard)?;
        conflict("fr", self.fwd_rev.then_some(true), loaded.fwd_rev)?;
        conflict("compressed", self.compressed.then_some(true), loaded.compressed)?;
        conflict("dynamic", self.dynamic.then_some(true), loaded.dynamic)?;
        let expect_sigma = if self.poremodel.is_some() { SIGMA_QSIG } else { loaded.sigma };
        if loaded.sigma != expect_sigma {
            return Err(Error::ConfigMismatch(format!(
                "alphabet: requested sigma {expect_sigma}, index was built with {}",
                loaded.sigma
            )));
        }
        if loaded.sigma == SIGMA_QSIG && self.poremodel.is_none() {
            return Err(Error::Usage(
                "this index uses the quantized-signal alphabet; --poremodel is required".into(),
            ));
        }
        Ok(())
    }
}

fn cidx_path(base: &Path) -> PathBuf {
    if base.extension().is_some_and(|e| e == "cidx") {
        base.to_path_buf()
    } else {
        let mut name = base.as_os_str().to_os_string();
        name.push(".cidx");
        PathBuf::from(name)
    }
}

fn run(args: &Args) -> Result<()> {
    if args.n_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.n_threads)
            .build_global()
            .map_err(|e| Error::Usage(format!("thread pool: {e}")))?;
    }

    let pore = match &args.poremodel {
        Some(path) => Some(PoreModel::load(path)?),
        None => None,
    };

    match args.phase()? {
        Phase::Index => {
            let cfg = args.config()?;
            let reference = args.reference.as_ref().unwrap();
            let mut index = AnyIndex::new(cfg);
            index_fasta(&mut index, reference, pore.as_ref())?;
            let target = cidx_path(args.idx.as_deref().unwrap_or(reference.as_path()));
            index.dump_to_path(&target)?;
        }
        Phase::Query => {
            let mut index = AnyIndex::load_from_path(args.idx.as_ref().unwrap())?;
            args.check_loaded(index.config())?;
            index.set_query_params(args.bandwidth, args.presence_fraction);
            info!(
                k = index.config().k,
                sigma = index.config().sigma,
                refs = index.headers().len(),
                max_occ = index.max_occ(),
                "index ready"
            );
            query_fasta(
                &index,
                args.qry.as_ref().unwrap(),
                args.out.as_ref().unwrap(),
                pore.as_ref(),
            )?;
        }
        Phase::Both => {
            let cfg = args.config()?;
            let mut index = AnyIndex::new(cfg);
            index_fasta(&mut index, args.reference.as_ref().unwrap(), pore.as_ref())?;
            query_fasta(
                &index,
                args.qry.as_ref().unwrap(),
                args.out.as_ref().unwrap(),
                pore.as_ref(),
            )?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
