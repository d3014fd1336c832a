use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Zero faces, or more than one candidate face, survived detection.
    #[error("no single face detected ({found} candidate regions)")]
    NoFaceDetected { found: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// NaN or infinite components.
    #[error("embedding has non-finite components")]
    NonFiniteEmbedding,
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error("face is already enrolled under identity '{existing}'")]
    DuplicateFace { existing: String },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("index I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
