//! Crate-wide error type.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the pipeline and its supporting components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A weight download failed even after the retry budget was spent.
    #[error("download of {url} failed after {attempts} attempt(s): {reason}")]
    Download {
        url: String,
        attempts: usize,
        reason: String,
    },

    /// An archive member would be written outside the extraction directory.
    #[error("archive member {member:?} resolves outside destination {dest:?}")]
    PathTraversal { member: PathBuf, dest: PathBuf },

    /// The requested model name is not one we know how to run.
    #[error("unknown model variant {name:?}, choose from: {known}")]
    UnknownModelVariant { name: String, known: String },

    /// Every candidate image was rejected by the safety checker.
    #[error("generated image contained NSFW content; try running again with a different prompt")]
    AllOutputsRejected,

    /// Strict weight loading found keys that do not match the model.
    #[error(
        "weight file {path:?} does not match the model: {missing} missing, {unexpected} unexpected key(s)"
    )]
    WeightKeyMismatch {
        path: PathBuf,
        missing: usize,
        unexpected: usize,
    },

    /// Sampling options failed validation before the run started.
    #[error("invalid sampling options: {0}")]
    InvalidOptions(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("weight header: {0}")]
    WeightHeader(#[from] serde_json::Error),
}

impl Error {
    /// Whether a fetch hitting this error is worth retrying with a resumed
    /// byte range. Connection failures, timeouts and truncated transfers
    /// qualify; protocol-level rejections (404, bad request) do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_body()
                    || e.is_decode()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}
