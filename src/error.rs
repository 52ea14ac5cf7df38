//! Error taxonomy for the extraction pipeline.
//!
//! Container-level errors (`UnsupportedFormat`, `CorruptArchive`) skip one
//! container. `StagingIo` is recorded against one platform. The remaining
//! variants abort the run. Classification misses and build failures are not
//! errors at all: they are report entries and build outcomes.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported container format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("corrupt archive {}: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("staging '{member}' to {} failed: {source}", destination.display())]
    StagingIo {
        member: String,
        destination: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output root {} is unavailable: {reason}", path.display())]
    OutputRootUnavailable { path: PathBuf, reason: String },

    #[error("build-system checkout {} is unavailable: {reason}", path.display())]
    CheckoutUnavailable { path: PathBuf, reason: String },

    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that only invalidate a single container.
    pub fn is_container_skip(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat { .. } | Error::CorruptArchive { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
