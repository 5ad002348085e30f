//! Error kinds surfaced to callers of this crate.
//!
//! Variants track the "Error kinds surfaced to callers" table of the VM
//! lifecycle design directly: each has one trigger and is fatal for the
//! current operation unless noted otherwise. `CorruptRegistry` is
//! deliberately absent here — a corrupt port registry self-heals by being
//! treated as empty, logged at `warn`, and never returned to the caller.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("port allocation exhausted after {retries} attempts")]
    AllocationExhausted { retries: u32 },

    #[error("failed to start {what}: {detail}")]
    StartFailed { what: String, detail: String },

    #[error("VM failed to boot: {log_excerpt}")]
    BootFailed { log_excerpt: String },

    #[error("SSH did not become available within the deadline")]
    SshUnavailable { diagnostics: String },

    #[error("boot check `{check}` failed: {detail}\n{output}")]
    CheckFailed {
        check: String,
        detail: String,
        output: String,
    },

    #[error("proxy control plane error: {0}")]
    ProxyControlError(String),

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
