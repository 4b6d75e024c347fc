//! Error types for the orchestration engine.
//!
//! Library modules return these; the CLI layer wraps them in `anyhow`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Faults that abort or fail a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    /// Run requested before a required property was set.
    #[error("missing run parameter: {0}")]
    Setup(&'static str),

    /// A worker executable could not be started.
    #[error("failed to launch {worker} `{program}`: {source}")]
    Launch {
        worker: &'static str,
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The generator exited on its own with a failure status.
    #[error("generator failed ({0})")]
    GeneratorFailed(String),

    /// The analyzer process exited abnormally.
    #[error("analyzer terminated abnormally ({0})")]
    AnalyzerCrash(String),

    /// A cached result file could not be read back.
    #[error("unable to retrieve saved results `{file}`: {source}")]
    CacheLookup {
        file: String,
        #[source]
        source: YodaError,
    },

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// FIFO creation or release failures.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("invalid channel name `{0}`: must be a single path component")]
    InvalidName(String),

    #[error("failed to create channel directory: {0}")]
    Directory(#[source] io::Error),

    #[error("failed to create fifo `{path}`: {source}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to release channel `{path}`: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result-file codec failures.
#[derive(Error, Debug)]
pub enum YodaError {
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl YodaError {
    /// True when the underlying file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, YodaError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Result cache backend failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache store I/O on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache document at line {line}: {source}")]
    Document {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Generator parameter file failures.
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("failed to read parameters from `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to save parameters to `{path}`: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Analysis catalog lookup failures.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("unknown analysis `{0}`")]
    Unknown(String),

    #[error("failed to read analysis info `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid analysis info `{path}`: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures inside the analyzer worker before or while it runs.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("snapshot interval must be at least 1")]
    Interval,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("failed to open event source `{path}`: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write results to `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Decode(#[from] YodaError),
}
