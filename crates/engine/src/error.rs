use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Project construction failed inside the engine. The engine's own
    /// diagnostic text is preserved verbatim.
    #[error("failed to load project {root}: {message}")]
    LoadFailed { root: PathBuf, message: String },

    /// The engine no longer recognizes this project token (unloaded or
    /// replaced by a newer generation).
    #[error("invalid project handle")]
    InvalidHandle,

    #[error("document not found: {0}")]
    DocumentMissing(PathBuf),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}
