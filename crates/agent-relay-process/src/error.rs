use std::path::PathBuf;

use thiserror::Error;

/// Process coordination error.
///
/// Lock contention is not an error; acquisition returns `None` instead.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot locate a home directory; set AGENT_RELAY_HOME")]
    NoHomeDir,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ProcessError {
    ProcessError::Io {
        path: path.into(),
        source,
    }
}
