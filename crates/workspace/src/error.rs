use navspace_engine::EngineError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// No live handle for this root and the caller did not ask to load one.
    #[error("project not loaded: {0}")]
    ProjectNotLoaded(PathBuf),

    /// Path outside the project or unreadable.
    #[error("document not found: {0}")]
    DocumentNotFound(PathBuf),

    /// The handle's generation no longer matches the live project model.
    /// Callers get one automatic invalidate-and-retry before seeing this.
    #[error("stale project handle for {root} (generation {generation})")]
    StaleHandle { root: PathBuf, generation: u64 },

    /// The handle was closed (explicitly or by idle eviction) while the
    /// operation was in flight.
    #[error("project handle closed: {0}")]
    HandleClosed(PathBuf),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("operation cancelled")]
    Cancelled,
}
