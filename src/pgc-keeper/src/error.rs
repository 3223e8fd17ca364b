use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures the keeper and its collaborators can report. Only failures that
/// matter to the caller's exit code surface here; per-candidate failures
/// during a directory walk are swallowed at the point they occur.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to allocate resources for {what}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("host primitive failed: {what}")]
    Host {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to open fillup file {path:?}")]
    FillupFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    FaultShield(#[from] pgc_faultshield::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
