use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors surfaced to the caller. Violated internal invariants (size
/// mismatches, out-of-bounds queue access, unsorted sort output) are bugs,
/// not errors, and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("{}: {source}", path.display())]
    File { path: PathBuf, source: io::Error },
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("index config mismatch: {0}")]
    ConfigMismatch(String),
    #[error("bad arguments: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn file(path: &Path, source: io::Error) -> Self {
        Error::File {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Classify a read failure: a short read means the file is truncated,
    /// anything else is plain i/o.
    pub fn from_read(source: io::Error, what: &str) -> Self {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            Error::Malformed(format!("truncated {what}"))
        } else {
            Error::Io(source)
        }
    }
}
