#![doc = include_str!("../README.md")]

pub mod pool;

pub mod cqueue;

pub use cqueue::ChunkedQueue;

pub mod extsort;

pub mod kmer;

pub mod heavyhitter;

pub mod compress;

pub mod csr;

pub mod tiered;

pub mod io;

pub mod error;

pub use error::{Error, Result};

pub mod config;

pub use config::IndexConfig;

pub mod index;

pub use index::{Alignment, AnyIndex, CoordIndex, RefIndex};

pub mod jaccard;

pub use jaccard::JaccardIndex;

pub mod dynamic;

pub use dynamic::DynamicIndex;

pub mod fasta;

pub mod poremodel;

pub mod pipeline;
